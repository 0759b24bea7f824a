//! Course catalog endpoints (read-only)

use axum::{
    extract::{Path, State},
    Json,
};
use lumen_common::catalog::{CourseCatalogEntry, ModuleCatalogEntry};

use crate::error::ApiResult;
use crate::AppState;

/// GET /api/catalog/courses
pub async fn list_courses(State(state): State<AppState>) -> Json<Vec<CourseCatalogEntry>> {
    Json(state.service.catalog().list_courses())
}

/// GET /api/catalog/courses/:course_id
pub async fn get_course(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
) -> ApiResult<Json<CourseCatalogEntry>> {
    Ok(Json(state.service.catalog().get_course(&course_id)?))
}

/// GET /api/catalog/courses/:course_id/modules
///
/// Modules in course order.
pub async fn get_course_modules(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
) -> ApiResult<Json<Vec<ModuleCatalogEntry>>> {
    Ok(Json(state.service.catalog().get_modules(&course_id)?))
}
