//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tracing::warn;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub database: bool,
}

/// GET /health
///
/// Reports "degraded" rather than failing when the database is unreachable.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Health check: database unreachable: {}", e);
            false
        }
    };

    Json(HealthResponse {
        status: if database { "ok" } else { "degraded" }.to_string(),
        module: "lumen-pt".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
