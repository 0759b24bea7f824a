//! HTTP API handlers for lumen-pt

pub mod catalog;
pub mod health;
pub mod progress;
pub mod sse;
pub mod users;

pub use catalog::{get_course, get_course_modules, list_courses};
pub use health::health_routes;
pub use progress::{close_session, get_progress, toggle_module};
pub use sse::event_stream;
pub use users::{
    award_points, complete_onboarding, get_dashboard, get_profile, get_stats, initialize_user,
    list_enrollments, point_history, record_login, set_favorite, update_streak,
};
