//! Database initialization
//!
//! Creates the database on first run and brings the schema up to date.
//! Every statement is idempotent, so this runs on each startup.

use crate::tier::Tier;
use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{debug, info};

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows readers alongside the single writer
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    init_schema(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema
///
/// One connection only: each SQLite memory connection is its own database.
pub async fn init_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables on an open pool (idempotent)
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    create_schema_version_table(pool).await?;
    create_user_profiles_table(pool).await?;
    create_user_stats_table(pool).await?;
    create_learning_streaks_table(pool).await?;
    create_course_enrollments_table(pool).await?;
    create_point_transactions_table(pool).await?;

    for tier in Tier::ALL {
        create_progress_table(pool, tier).await?;
    }

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    debug!("Schema version {} ready", SCHEMA_VERSION);
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_user_profiles_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_profiles (
            user_id TEXT PRIMARY KEY,
            learning_goal TEXT,
            experience_level TEXT,
            time_commitment TEXT,
            onboarding_completed INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_user_stats_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_stats (
            user_id TEXT PRIMARY KEY REFERENCES user_profiles(user_id) ON DELETE CASCADE,
            total_skill_points INTEGER NOT NULL DEFAULT 0,
            current_level INTEGER NOT NULL DEFAULT 1,
            experience_points INTEGER NOT NULL DEFAULT 0,
            points_to_next_level INTEGER NOT NULL DEFAULT 0,
            courses_completed INTEGER NOT NULL DEFAULT 0,
            videos_watched INTEGER NOT NULL DEFAULT 0,
            total_study_time_minutes INTEGER NOT NULL DEFAULT 0,
            is_new_user INTEGER NOT NULL DEFAULT 1,
            login_streak_days INTEGER NOT NULL DEFAULT 0,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (experience_points >= 0),
            CHECK (current_level >= 1)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_learning_streaks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS learning_streaks (
            user_id TEXT PRIMARY KEY REFERENCES user_profiles(user_id) ON DELETE CASCADE,
            current_streak INTEGER NOT NULL DEFAULT 0,
            longest_streak INTEGER NOT NULL DEFAULT 0,
            last_activity_date TEXT,
            streak_start_date TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_course_enrollments_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS course_enrollments (
            user_id TEXT NOT NULL REFERENCES user_profiles(user_id) ON DELETE CASCADE,
            course_id TEXT NOT NULL,
            progress_percentage INTEGER NOT NULL DEFAULT 0,
            started_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_accessed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            completed_at TIMESTAMP,
            is_favorite INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, course_id),
            CHECK (progress_percentage BETWEEN 0 AND 100)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_point_transactions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS point_transactions (
            guid TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES user_profiles(user_id) ON DELETE CASCADE,
            points INTEGER NOT NULL,
            reason TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_point_transactions_user ON point_transactions(user_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create one tier's progress table
///
/// All four tiers share this definition. The composite index is not UNIQUE;
/// the insert-always duplicate policy appends rows.
async fn create_progress_table(pool: &SqlitePool, tier: Tier) -> Result<()> {
    let table = tier.table_name();

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            learning_goal TEXT NOT NULL DEFAULT '',
            current_course TEXT NOT NULL,
            current_module TEXT NOT NULL,
            total_modules_in_course INTEGER NOT NULL DEFAULT 0,
            is_completed INTEGER NOT NULL DEFAULT 1,
            module_id INTEGER NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_key ON {table}(user_id, current_course, current_module)"
    ))
    .execute(pool)
    .await?;

    Ok(())
}
