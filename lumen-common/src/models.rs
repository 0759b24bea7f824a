//! Progress data model
//!
//! Row types for the tier progress tables and the per-user aggregate tables.
//! Column names match field names one to one.

use crate::levels::LevelCurve;
use crate::tier::Tier;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One completed module for one user, within a single tier's table
///
/// At most one row per (user_id, current_course, current_module) is expected
/// per tier; the reconciler checks before inserting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct CompletionRecord {
    pub user_id: String,
    /// Denormalized from the user's profile at completion time
    pub learning_goal: String,
    pub current_course: String,
    pub current_module: String,
    /// Snapshot of the course's module count when the row was written
    pub total_modules_in_course: i64,
    pub is_completed: bool,
    pub module_id: i64,
}

impl CompletionRecord {
    /// Whether this row belongs to the given course/module pair
    pub fn matches(&self, course: &str, module: &str) -> bool {
        self.current_course == course && self.current_module == module
    }

    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(&self.current_course, self.module_id)
    }
}

/// Identity of a module inside a course, used to key in-memory progress
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    pub course_id: String,
    pub module_id: i64,
}

impl ModuleKey {
    pub fn new(course_id: impl Into<String>, module_id: i64) -> Self {
        Self {
            course_id: course_id.into(),
            module_id,
        }
    }
}

/// Aggregate gamification stats, one row per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UserStats {
    pub user_id: String,
    pub total_skill_points: i64,
    pub current_level: i64,
    pub experience_points: i64,
    pub points_to_next_level: i64,
    pub courses_completed: i64,
    pub videos_watched: i64,
    pub total_study_time_minutes: i64,
    pub is_new_user: bool,
    pub login_streak_days: i64,
}

impl UserStats {
    /// Zero-value stats for a user, with level fields taken from the curve
    ///
    /// Also used as the display fallback when stats cannot be loaded.
    pub fn zero(user_id: &str, curve: &dyn LevelCurve) -> Self {
        let progress = curve.progress(0);
        Self {
            user_id: user_id.to_string(),
            total_skill_points: 0,
            current_level: progress.level,
            experience_points: 0,
            points_to_next_level: progress.points_to_next_level,
            courses_completed: 0,
            videos_watched: 0,
            total_study_time_minutes: 0,
            is_new_user: true,
            login_streak_days: 0,
        }
    }
}

/// Consecutive-day activity counter, one row per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct LearningStreak {
    pub user_id: String,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_activity_date: Option<NaiveDate>,
    pub streak_start_date: Option<NaiveDate>,
}

impl LearningStreak {
    /// A streak with no recorded activity
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            current_streak: 0,
            longest_streak: 0,
            last_activity_date: None,
            streak_start_date: None,
        }
    }
}

/// Per-course progress summary, one row per (user, course)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct CourseEnrollment {
    pub user_id: String,
    pub course_id: String,
    pub progress_percentage: i64,
    pub started_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_favorite: bool,
}

/// Onboarding answers, one row per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UserProfile {
    pub user_id: String,
    pub learning_goal: Option<String>,
    pub experience_level: Option<String>,
    /// Stored tier name; see [`UserProfile::tier`]
    pub time_commitment: Option<String>,
    pub onboarding_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// Commitment tier from the stored answer, defaulting when absent or unknown
    pub fn tier(&self) -> Tier {
        Tier::parse_or_default(self.time_commitment.as_deref())
    }
}

/// One entry of the point ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PointTransaction {
    pub guid: String,
    pub user_id: String,
    pub points: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels::SteppedLevelCurve;

    fn record(course: &str, module: &str, id: i64) -> CompletionRecord {
        CompletionRecord {
            user_id: "user-1".to_string(),
            learning_goal: "web-development".to_string(),
            current_course: course.to_string(),
            current_module: module.to_string(),
            total_modules_in_course: 8,
            is_completed: true,
            module_id: id,
        }
    }

    #[test]
    fn test_record_matches_course_and_module() {
        let r = record("html-css-mastery", "1", 1);
        assert!(r.matches("html-css-mastery", "1"));
        assert!(!r.matches("html-css-mastery", "2"));
        assert!(!r.matches("js-fundamentals", "1"));
        assert_eq!(r.key(), ModuleKey::new("html-css-mastery", 1));
    }

    #[test]
    fn test_zero_stats_use_curve() {
        let curve = SteppedLevelCurve::default();
        let stats = UserStats::zero("user-1", &curve);
        assert_eq!(stats.current_level, 1);
        assert_eq!(stats.experience_points, 0);
        assert_eq!(stats.points_to_next_level, 100);
        assert!(stats.is_new_user);
    }

    #[test]
    fn test_profile_tier_defaults() {
        let now = Utc::now();
        let mut profile = UserProfile {
            user_id: "u".into(),
            learning_goal: None,
            experience_level: None,
            time_commitment: None,
            onboarding_completed: false,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(profile.tier(), Tier::Moderate);
        profile.time_commitment = Some("intensive".into());
        assert_eq!(profile.tier(), Tier::Intensive);
        profile.time_commitment = Some("ultra".into());
        assert_eq!(profile.tier(), Tier::Moderate);
    }
}
