//! lumen-pt library - Progress Tracking service
//!
//! Tier-partitioned module completion with optimistic reconciliation, plus
//! the points, levels, streaks and enrollment progress derived from it.

use axum::Router;
use lumen_common::catalog::CatalogProvider;
use lumen_common::config::TomlConfig;
use lumen_common::events::EventBus;
use lumen_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod aggregator;
pub mod api;
pub mod error;
pub mod reconciler;
pub mod service;
pub mod store;

use aggregator::StatsAggregator;
use service::ProgressService;
use store::TierSelector;

/// Capacity of the progress event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Session registry and toggle orchestration
    pub service: Arc<ProgressService>,
    /// Progress event broadcast
    pub event_bus: EventBus,
}

impl AppState {
    /// Wire the service graph over one database pool
    pub fn new(
        db: SqlitePool,
        catalog: Arc<dyn CatalogProvider>,
        config: &TomlConfig,
    ) -> Result<Self> {
        let event_bus = EventBus::new(EVENT_CHANNEL_CAPACITY);
        let curve = Arc::new(config.levels.curve()?);
        let aggregator = Arc::new(StatsAggregator::new(
            db.clone(),
            curve,
            config.points,
            event_bus.clone(),
        ));
        let service = Arc::new(ProgressService::new(
            TierSelector::sqlite(db.clone(), config.tiers.default),
            aggregator,
            catalog,
            event_bus.clone(),
            config.tiers.duplicate_policy,
        ));

        Ok(Self {
            db,
            service,
            event_bus,
        })
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{delete, get, post};

    let users = Router::new()
        .route("/api/users/:user_id/init", post(api::initialize_user))
        .route(
            "/api/users/:user_id/onboarding",
            post(api::complete_onboarding),
        )
        .route("/api/users/:user_id/profile", get(api::get_profile))
        .route(
            "/api/users/:user_id/courses/:course_id/progress",
            get(api::get_progress),
        )
        .route(
            "/api/users/:user_id/courses/:course_id/modules/:module_id/toggle",
            post(api::toggle_module),
        )
        .route("/api/users/:user_id/session", delete(api::close_session))
        .route("/api/users/:user_id/stats", get(api::get_stats))
        .route(
            "/api/users/:user_id/points",
            get(api::point_history).post(api::award_points),
        )
        .route("/api/users/:user_id/streak", post(api::update_streak))
        .route("/api/users/:user_id/login", post(api::record_login))
        .route("/api/users/:user_id/dashboard", get(api::get_dashboard))
        .route("/api/users/:user_id/enrollments", get(api::list_enrollments))
        .route(
            "/api/users/:user_id/courses/:course_id/favorite",
            post(api::set_favorite),
        );

    let catalog = Router::new()
        .route("/api/catalog/courses", get(api::list_courses))
        .route("/api/catalog/courses/:course_id", get(api::get_course))
        .route(
            "/api/catalog/courses/:course_id/modules",
            get(api::get_course_modules),
        );

    Router::new()
        .merge(users)
        .merge(catalog)
        .route("/api/events", get(api::event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
