//! Module progress endpoints
//!
//! Every endpoint takes an optional `tier` query parameter; unknown or
//! missing values select the configured default tier.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiResult;
use crate::service::{CourseProgress, ToggleReport};
use crate::AppState;
use lumen_common::Tier;

/// Tier selection query
#[derive(Debug, Default, Deserialize)]
pub struct TierQuery {
    pub tier: Option<String>,
}

/// Response for session close
#[derive(Debug, Serialize)]
pub struct CloseSessionResponse {
    pub user_id: String,
    pub tier: Tier,
    /// A session was open and has been closed
    pub closed: bool,
}

/// GET /api/users/:user_id/courses/:course_id/progress
pub async fn get_progress(
    State(state): State<AppState>,
    Path((user_id, course_id)): Path<(String, String)>,
    Query(query): Query<TierQuery>,
) -> ApiResult<Json<CourseProgress>> {
    let tier = state.service.resolve_tier(query.tier.as_deref());
    let progress = state.service.progress(&user_id, &course_id, tier).await?;
    Ok(Json(progress))
}

/// POST /api/users/:user_id/courses/:course_id/modules/:module_id/toggle
///
/// Responds 503 when the store write failed; the module is back in its
/// persisted state in that case.
pub async fn toggle_module(
    State(state): State<AppState>,
    Path((user_id, course_id, module_id)): Path<(String, String, i64)>,
    Query(query): Query<TierQuery>,
) -> ApiResult<Json<ToggleReport>> {
    let tier = state.service.resolve_tier(query.tier.as_deref());
    let report = state
        .service
        .toggle(&user_id, &course_id, module_id, tier)
        .await?;
    Ok(Json(report))
}

/// DELETE /api/users/:user_id/session
pub async fn close_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TierQuery>,
) -> Json<CloseSessionResponse> {
    let tier = state.service.resolve_tier(query.tier.as_deref());
    let closed = state.service.close_session(&user_id, tier).await;
    if closed {
        info!("Session closed by client: {} ('{}' tier)", user_id, tier);
    }
    Json(CloseSessionResponse {
        user_id,
        tier,
        closed,
    })
}
