//! Per-user endpoints: onboarding, stats, points, streaks and enrollments

use axum::{
    extract::{Path, Query, State},
    Json,
};
use lumen_common::models::{
    CourseEnrollment, LearningStreak, PointTransaction, UserProfile, UserStats,
};
use lumen_common::streak::StreakChange;
use lumen_common::{time, Tier};
use serde::{Deserialize, Serialize};

use crate::aggregator::Dashboard;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Response for user initialization
#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub user_id: String,
    /// False when the user already existed
    pub created: bool,
}

/// Onboarding answers
#[derive(Debug, Deserialize)]
pub struct OnboardingRequest {
    pub learning_goal: String,
    pub experience_level: String,
    /// Commitment tier name; unknown values fall back to the default tier
    pub time_commitment: String,
}

/// Profile plus the tier its answer resolves to
#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub tier: Tier,
}

impl From<UserProfile> for ProfileResponse {
    fn from(profile: UserProfile) -> Self {
        let tier = profile.tier();
        Self { profile, tier }
    }
}

/// Point award request
#[derive(Debug, Deserialize)]
pub struct AwardRequest {
    pub points: i64,
    pub reason: String,
}

/// Query parameters for the point ledger
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

/// Streak update request; the date defaults to today (UTC)
#[derive(Debug, Default, Deserialize)]
pub struct StreakRequest {
    /// Activity date as YYYY-MM-DD
    pub date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StreakResponse {
    #[serde(flatten)]
    pub streak: LearningStreak,
    pub change: StreakChange,
}

/// Favorite flag request
#[derive(Debug, Deserialize)]
pub struct FavoriteRequest {
    pub is_favorite: bool,
}

/// POST /api/users/:user_id/init
pub async fn initialize_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<InitResponse>> {
    let created = state
        .service
        .aggregator()
        .initialize_new_user(&user_id)
        .await?;
    Ok(Json(InitResponse { user_id, created }))
}

/// POST /api/users/:user_id/onboarding
pub async fn complete_onboarding(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<OnboardingRequest>,
) -> ApiResult<Json<ProfileResponse>> {
    let profile = state
        .service
        .aggregator()
        .complete_onboarding(
            &user_id,
            &request.learning_goal,
            &request.experience_level,
            &request.time_commitment,
        )
        .await?;
    Ok(Json(profile.into()))
}

/// GET /api/users/:user_id/profile
pub async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<ProfileResponse>> {
    let profile = state.service.aggregator().get_profile(&user_id).await?;
    Ok(Json(profile.into()))
}

/// GET /api/users/:user_id/stats
///
/// Always succeeds; unknown users and read failures show zero values.
pub async fn get_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<UserStats> {
    Json(state.service.aggregator().stats_or_default(&user_id).await)
}

/// POST /api/users/:user_id/points
pub async fn award_points(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<AwardRequest>,
) -> ApiResult<Json<UserStats>> {
    let stats = state
        .service
        .aggregator()
        .award_points(&user_id, request.points, &request.reason)
        .await?;
    Ok(Json(stats))
}

/// GET /api/users/:user_id/points
pub async fn point_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<PointTransaction>>> {
    let history = state
        .service
        .aggregator()
        .point_history(&user_id, query.limit)
        .await?;
    Ok(Json(history))
}

/// POST /api/users/:user_id/streak
pub async fn update_streak(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    request: Option<Json<StreakRequest>>,
) -> ApiResult<Json<StreakResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let date = match request.date.as_deref() {
        Some(raw) => time::parse_date(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid date '{}'", raw)))?,
        None => time::today(),
    };

    let (streak, change) = state
        .service
        .aggregator()
        .update_streak(&user_id, date)
        .await?;
    Ok(Json(StreakResponse { streak, change }))
}

/// POST /api/users/:user_id/login
pub async fn record_login(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserStats>> {
    let stats = state
        .service
        .aggregator()
        .update_learning_streak(&user_id)
        .await?;
    Ok(Json(stats))
}

/// GET /api/users/:user_id/dashboard
pub async fn get_dashboard(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<Dashboard> {
    Json(state.service.aggregator().dashboard(&user_id).await)
}

/// GET /api/users/:user_id/enrollments
pub async fn list_enrollments(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<CourseEnrollment>>> {
    let enrollments = state
        .service
        .aggregator()
        .list_enrollments(&user_id)
        .await?;
    Ok(Json(enrollments))
}

/// POST /api/users/:user_id/courses/:course_id/favorite
pub async fn set_favorite(
    State(state): State<AppState>,
    Path((user_id, course_id)): Path<(String, String)>,
    Json(request): Json<FavoriteRequest>,
) -> ApiResult<Json<CourseEnrollment>> {
    // Unknown courses are rejected before an enrollment row is created
    state.service.catalog().get_course(&course_id)?;
    let enrollment = state
        .service
        .aggregator()
        .set_favorite(&user_id, &course_id, request.is_favorite)
        .await?;
    Ok(Json(enrollment))
}
