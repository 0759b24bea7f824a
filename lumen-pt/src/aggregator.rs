//! Stats aggregator
//!
//! Owns the per-user aggregate rows: `user_stats`, `learning_streaks`,
//! `course_enrollments` and the point ledger. Every write that touches more
//! than one row runs in a single transaction.

use chrono::NaiveDate;
use lumen_common::config::PointsPolicy;
use lumen_common::events::{EventBus, ProgressEvent};
use lumen_common::levels::{compute_percent_complete, LevelCurve};
use lumen_common::models::{
    CourseEnrollment, LearningStreak, PointTransaction, UserProfile, UserStats,
};
use lumen_common::streak::{self, StreakChange};
use lumen_common::{time, Error, Result, Tier};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reason recorded for module (video) completion awards
pub const REASON_VIDEO: &str = "video";

/// Reason recorded for course completion awards
pub const REASON_CERTIFICATION: &str = "certification";

/// Largest number of points one award may grant
pub const MAX_SINGLE_AWARD: i64 = 1_000_000;

/// Result of recomputing a course's percent complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentUpdate {
    pub enrollment: CourseEnrollment,
    /// The course reached 100 % for the first time
    pub newly_completed: bool,
}

/// Streak as stored plus the value to display today
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreakView {
    #[serde(flatten)]
    pub streak: LearningStreak,
    pub display_streak: i64,
}

/// Everything the dashboard renders
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    pub stats: UserStats,
    pub streak: StreakView,
    pub enrollments: Vec<CourseEnrollment>,
    /// Some part could not be loaded and shows fallback values
    pub degraded: bool,
}

/// Derives and persists points, levels, streaks and enrollment progress
pub struct StatsAggregator {
    pool: SqlitePool,
    curve: Arc<dyn LevelCurve>,
    points: PointsPolicy,
    events: EventBus,
}

impl StatsAggregator {
    pub fn new(
        pool: SqlitePool,
        curve: Arc<dyn LevelCurve>,
        points: PointsPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            curve,
            points,
            events,
        }
    }

    pub fn points_policy(&self) -> PointsPolicy {
        self.points
    }

    pub fn curve(&self) -> &dyn LevelCurve {
        self.curve.as_ref()
    }

    // ------------------------------------------------------------------
    // Users and onboarding
    // ------------------------------------------------------------------

    /// Create profile, stats and streak rows if absent
    ///
    /// Idempotent; returns `true` only when the user was created by this call.
    pub async fn initialize_new_user(&self, user_id: &str) -> Result<bool> {
        validate_user_id(user_id)?;
        let mut tx = self.pool.begin().await?;
        let created = ensure_user(&mut tx, user_id, self.curve.as_ref()).await?;
        tx.commit().await?;

        if created {
            info!("Initialized new user {}", user_id);
        }
        Ok(created)
    }

    /// Store onboarding answers; re-running overwrites previous answers
    ///
    /// Unknown commitment values are stored as the default tier.
    pub async fn complete_onboarding(
        &self,
        user_id: &str,
        learning_goal: &str,
        experience_level: &str,
        time_commitment: &str,
    ) -> Result<UserProfile> {
        validate_user_id(user_id)?;
        let tier = Tier::parse_or_default(Some(time_commitment));

        let mut tx = self.pool.begin().await?;
        ensure_user(&mut tx, user_id, self.curve.as_ref()).await?;
        sqlx::query(
            r#"
            UPDATE user_profiles
            SET learning_goal = ?, experience_level = ?, time_commitment = ?,
                onboarding_completed = 1, updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(learning_goal.trim())
        .bind(experience_level.trim())
        .bind(tier.as_str())
        .bind(time::now())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("User {} completed onboarding ('{}' tier)", user_id, tier);
        self.get_profile(user_id).await
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<UserProfile> {
        sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT user_id, learning_goal, experience_level, time_commitment,
                   onboarding_completed, created_at, updated_at
            FROM user_profiles
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user '{}'", user_id)))
    }

    // ------------------------------------------------------------------
    // Stats and points
    // ------------------------------------------------------------------

    pub async fn get_stats(&self, user_id: &str) -> Result<UserStats> {
        fetch_stats(&self.pool, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("stats for user '{}'", user_id)))
    }

    /// Stats for display; zero values when missing or unreadable
    pub async fn stats_or_default(&self, user_id: &str) -> UserStats {
        match fetch_stats(&self.pool, user_id).await {
            Ok(Some(stats)) => stats,
            Ok(None) => UserStats::zero(user_id, self.curve.as_ref()),
            Err(e) => {
                warn!("Could not load stats for {}: {}; showing defaults", user_id, e);
                UserStats::zero(user_id, self.curve.as_ref())
            }
        }
    }

    /// Add points, recompute level and record the award in the ledger
    pub async fn award_points(&self, user_id: &str, points: i64, reason: &str) -> Result<UserStats> {
        validate_user_id(user_id)?;
        validate_award(points, reason)?;

        let mut tx = self.pool.begin().await?;
        ensure_user(&mut tx, user_id, self.curve.as_ref()).await?;
        let (old_level, stats) =
            apply_points(&mut tx, user_id, points, reason, self.curve.as_ref()).await?;
        tx.commit().await?;

        self.announce_points(&stats, points, reason, old_level);
        Ok(stats)
    }

    /// Count a watched video and its minutes towards study totals
    pub async fn record_video_watched(&self, user_id: &str, minutes: i64) -> Result<UserStats> {
        validate_user_id(user_id)?;
        let mut tx = self.pool.begin().await?;
        ensure_user(&mut tx, user_id, self.curve.as_ref()).await?;
        sqlx::query(
            r#"
            UPDATE user_stats
            SET videos_watched = videos_watched + 1,
                total_study_time_minutes = total_study_time_minutes + ?,
                updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(minutes.max(0))
        .bind(time::now())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_stats(user_id).await
    }

    pub async fn point_history(&self, user_id: &str, limit: i64) -> Result<Vec<PointTransaction>> {
        let rows = sqlx::query_as::<_, PointTransaction>(
            r#"
            SELECT guid, user_id, points, reason, created_at
            FROM point_transactions
            WHERE user_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    fn announce_points(&self, stats: &UserStats, points: i64, reason: &str, old_level: i64) {
        let now = time::now();
        self.events.emit_lossy(ProgressEvent::PointsAwarded {
            user_id: stats.user_id.clone(),
            points,
            reason: reason.to_string(),
            experience_points: stats.experience_points,
            timestamp: now,
        });
        if stats.current_level > old_level {
            info!(
                "User {} reached level {} (from {})",
                stats.user_id, stats.current_level, old_level
            );
            self.events.emit_lossy(ProgressEvent::LevelUp {
                user_id: stats.user_id.clone(),
                old_level,
                new_level: stats.current_level,
                timestamp: now,
            });
        }
    }

    // ------------------------------------------------------------------
    // Streaks
    // ------------------------------------------------------------------

    pub async fn get_streak(&self, user_id: &str) -> Result<LearningStreak> {
        Ok(fetch_streak(&self.pool, user_id)
            .await?
            .unwrap_or_else(|| LearningStreak::empty(user_id)))
    }

    /// Record activity on `activity_date`
    pub async fn update_streak(
        &self,
        user_id: &str,
        activity_date: NaiveDate,
    ) -> Result<(LearningStreak, StreakChange)> {
        validate_user_id(user_id)?;
        let mut tx = self.pool.begin().await?;
        ensure_user(&mut tx, user_id, self.curve.as_ref()).await?;

        let mut streak = fetch_streak(&mut *tx, user_id)
            .await?
            .unwrap_or_else(|| LearningStreak::empty(user_id));
        let change = streak::advance(&mut streak, activity_date);

        if !matches!(change, StreakChange::Unchanged | StreakChange::Backdated) {
            sqlx::query(
                r#"
                UPDATE learning_streaks
                SET current_streak = ?, longest_streak = ?, last_activity_date = ?,
                    streak_start_date = ?, updated_at = ?
                WHERE user_id = ?
                "#,
            )
            .bind(streak.current_streak)
            .bind(streak.longest_streak)
            .bind(streak.last_activity_date)
            .bind(streak.streak_start_date)
            .bind(time::now())
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if !matches!(change, StreakChange::Unchanged | StreakChange::Backdated) {
            debug!(
                "Streak for {} {:?}: current {}, longest {}",
                user_id, change, streak.current_streak, streak.longest_streak
            );
            self.events.emit_lossy(ProgressEvent::StreakUpdated {
                user_id: user_id.to_string(),
                change,
                current_streak: streak.current_streak,
                longest_streak: streak.longest_streak,
                timestamp: time::now(),
            });
        }

        Ok((streak, change))
    }

    /// Daily login: record today's activity and mirror it into the stats row
    pub async fn update_learning_streak(&self, user_id: &str) -> Result<UserStats> {
        let (streak, _) = self.update_streak(user_id, time::today()).await?;
        sqlx::query(
            r#"
            UPDATE user_stats
            SET login_streak_days = ?, is_new_user = 0, updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(streak.current_streak)
        .bind(time::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        self.get_stats(user_id).await
    }

    // ------------------------------------------------------------------
    // Enrollments
    // ------------------------------------------------------------------

    /// Start tracking a course for a user (idempotent)
    pub async fn enroll(&self, user_id: &str, course_id: &str) -> Result<CourseEnrollment> {
        validate_user_id(user_id)?;
        let now = time::now();
        let mut tx = self.pool.begin().await?;
        ensure_user(&mut tx, user_id, self.curve.as_ref()).await?;
        sqlx::query(
            r#"
            INSERT INTO course_enrollments (user_id, course_id, started_at, last_accessed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, course_id) DO UPDATE SET last_accessed_at = excluded.last_accessed_at
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let enrollment = fetch_enrollment(&mut *tx, user_id, course_id).await?;
        tx.commit().await?;
        Ok(enrollment)
    }

    /// Recompute a course's percent complete from the completed-module count
    ///
    /// The first time a course reaches 100 % it is marked completed, the
    /// user's `courses_completed` is incremented and the course completion
    /// award is granted, all in the same transaction.
    pub async fn recompute_enrollment(
        &self,
        user_id: &str,
        course_id: &str,
        completed_count: usize,
        total_modules: usize,
    ) -> Result<EnrollmentUpdate> {
        validate_user_id(user_id)?;
        let percentage = i64::from(compute_percent_complete(completed_count, total_modules));
        let now = time::now();

        let mut tx = self.pool.begin().await?;
        ensure_user(&mut tx, user_id, self.curve.as_ref()).await?;

        sqlx::query(
            r#"
            INSERT INTO course_enrollments
                (user_id, course_id, progress_percentage, started_at, last_accessed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, course_id) DO UPDATE SET
                progress_percentage = excluded.progress_percentage,
                last_accessed_at = excluded.last_accessed_at
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(percentage)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut enrollment = fetch_enrollment(&mut *tx, user_id, course_id).await?;
        let newly_completed = percentage == 100 && enrollment.completed_at.is_none();

        let mut awarded = None;
        if newly_completed {
            sqlx::query(
                "UPDATE course_enrollments SET completed_at = ? WHERE user_id = ? AND course_id = ?",
            )
            .bind(now)
            .bind(user_id)
            .bind(course_id)
            .execute(&mut *tx)
            .await?;
            enrollment.completed_at = Some(now);

            sqlx::query(
                "UPDATE user_stats SET courses_completed = courses_completed + 1 WHERE user_id = ?",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

            let points = self.points.course_completion;
            if points > 0 {
                let (old_level, stats) = apply_points(
                    &mut tx,
                    user_id,
                    points,
                    REASON_CERTIFICATION,
                    self.curve.as_ref(),
                )
                .await?;
                awarded = Some((old_level, stats, points));
            }
        }
        tx.commit().await?;

        if newly_completed {
            info!("User {} completed course '{}'", user_id, course_id);
        }
        if let Some((old_level, stats, points)) = awarded {
            self.announce_points(&stats, points, REASON_CERTIFICATION, old_level);
        }
        self.events.emit_lossy(ProgressEvent::EnrollmentUpdated {
            user_id: user_id.to_string(),
            course_id: course_id.to_string(),
            progress_percentage: percentage,
            completed: enrollment.completed_at.is_some(),
            timestamp: now,
        });

        Ok(EnrollmentUpdate {
            enrollment,
            newly_completed,
        })
    }

    pub async fn set_favorite(
        &self,
        user_id: &str,
        course_id: &str,
        is_favorite: bool,
    ) -> Result<CourseEnrollment> {
        self.enroll(user_id, course_id).await?;
        sqlx::query(
            "UPDATE course_enrollments SET is_favorite = ? WHERE user_id = ? AND course_id = ?",
        )
        .bind(is_favorite)
        .bind(user_id)
        .bind(course_id)
        .execute(&self.pool)
        .await?;
        fetch_enrollment(&self.pool, user_id, course_id).await
    }

    /// Enrollments, most recently accessed first
    pub async fn list_enrollments(&self, user_id: &str) -> Result<Vec<CourseEnrollment>> {
        let rows = sqlx::query_as::<_, CourseEnrollment>(
            r#"
            SELECT user_id, course_id, progress_percentage, started_at, last_accessed_at,
                   completed_at, is_favorite
            FROM course_enrollments
            WHERE user_id = ?
            ORDER BY last_accessed_at DESC, course_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Dashboard summary; never fails, degrading each part to zero values
    pub async fn dashboard(&self, user_id: &str) -> Dashboard {
        let mut degraded = false;

        let stats = match fetch_stats(&self.pool, user_id).await {
            Ok(Some(stats)) => stats,
            Ok(None) => UserStats::zero(user_id, self.curve.as_ref()),
            Err(e) => {
                warn!("Dashboard stats unavailable for {}: {}", user_id, e);
                degraded = true;
                UserStats::zero(user_id, self.curve.as_ref())
            }
        };

        let streak = self.get_streak(user_id).await.unwrap_or_else(|e| {
            warn!("Dashboard streak unavailable for {}: {}", user_id, e);
            degraded = true;
            LearningStreak::empty(user_id)
        });

        let enrollments = self.list_enrollments(user_id).await.unwrap_or_else(|e| {
            warn!("Dashboard enrollments unavailable for {}: {}", user_id, e);
            degraded = true;
            Vec::new()
        });

        let display_streak = streak::current_as_of(&streak, time::today());
        Dashboard {
            stats,
            streak: StreakView {
                streak,
                display_streak,
            },
            enrollments,
            degraded,
        }
    }
}

fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::InvalidInput("user id must not be empty".to_string()));
    }
    Ok(())
}

fn validate_award(points: i64, reason: &str) -> Result<()> {
    if points <= 0 {
        return Err(Error::InvalidInput(format!(
            "points must be positive, got {}",
            points
        )));
    }
    if points > MAX_SINGLE_AWARD {
        return Err(Error::InvalidInput(format!(
            "a single award is limited to {} points, got {}",
            MAX_SINGLE_AWARD, points
        )));
    }
    if reason.trim().is_empty() {
        return Err(Error::InvalidInput("award reason must not be empty".to_string()));
    }
    Ok(())
}

/// Insert default rows for a user; returns whether the profile was new
async fn ensure_user(
    conn: &mut SqliteConnection,
    user_id: &str,
    curve: &dyn LevelCurve,
) -> Result<bool> {
    let now = time::now();
    let created = sqlx::query(
        "INSERT OR IGNORE INTO user_profiles (user_id, created_at, updated_at) VALUES (?, ?, ?)",
    )
    .bind(user_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected()
        == 1;

    let start = curve.progress(0);
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO user_stats (user_id, current_level, points_to_next_level, updated_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(start.level)
    .bind(start.points_to_next_level)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO learning_streaks (user_id, updated_at) VALUES (?, ?)")
        .bind(user_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    Ok(created)
}

/// Apply an award inside an open transaction; returns the previous level
async fn apply_points(
    conn: &mut SqliteConnection,
    user_id: &str,
    points: i64,
    reason: &str,
    curve: &dyn LevelCurve,
) -> Result<(i64, UserStats)> {
    let mut stats = fetch_stats(&mut *conn, user_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("stats for user '{}'", user_id)))?;
    let old_level = stats.current_level;

    let overflow = || {
        Error::InvalidInput(format!(
            "awarding {} points would overflow the totals for user '{}'",
            points, user_id
        ))
    };
    stats.experience_points = stats
        .experience_points
        .checked_add(points)
        .ok_or_else(overflow)?;
    stats.total_skill_points = stats
        .total_skill_points
        .checked_add(points)
        .ok_or_else(overflow)?;
    let progress = curve.progress(stats.experience_points);
    stats.current_level = progress.level;
    stats.points_to_next_level = progress.points_to_next_level;

    let now = time::now();
    sqlx::query(
        r#"
        UPDATE user_stats
        SET experience_points = ?, total_skill_points = ?, current_level = ?,
            points_to_next_level = ?, updated_at = ?
        WHERE user_id = ?
        "#,
    )
    .bind(stats.experience_points)
    .bind(stats.total_skill_points)
    .bind(stats.current_level)
    .bind(stats.points_to_next_level)
    .bind(now)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO point_transactions (guid, user_id, points, reason, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(points)
    .bind(reason.trim())
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok((old_level, stats))
}

async fn fetch_stats<'e, E>(executor: E, user_id: &str) -> Result<Option<UserStats>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let stats = sqlx::query_as::<_, UserStats>(
        r#"
        SELECT user_id, total_skill_points, current_level, experience_points,
               points_to_next_level, courses_completed, videos_watched,
               total_study_time_minutes, is_new_user, login_streak_days
        FROM user_stats
        WHERE user_id = ?
        "#,
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    Ok(stats)
}

async fn fetch_streak<'e, E>(executor: E, user_id: &str) -> Result<Option<LearningStreak>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let streak = sqlx::query_as::<_, LearningStreak>(
        r#"
        SELECT user_id, current_streak, longest_streak, last_activity_date, streak_start_date
        FROM learning_streaks
        WHERE user_id = ?
        "#,
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    Ok(streak)
}

async fn fetch_enrollment<'e, E>(executor: E, user_id: &str, course_id: &str) -> Result<CourseEnrollment>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query_as::<_, CourseEnrollment>(
        r#"
        SELECT user_id, course_id, progress_percentage, started_at, last_accessed_at,
               completed_at, is_favorite
        FROM course_enrollments
        WHERE user_id = ? AND course_id = ?
        "#,
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| {
        Error::NotFound(format!(
            "enrollment for user '{}' in course '{}'",
            user_id, course_id
        ))
    })
}
