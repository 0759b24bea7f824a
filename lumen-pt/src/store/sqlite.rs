//! SQLite-backed progress store, parametrized by tier table

use super::ProgressStore;
use lumen_common::models::CompletionRecord;
use lumen_common::{Error, Result, Tier};
use sqlx::SqlitePool;
use tracing::{debug, warn};

/// Progress store over one tier's table in the shared database
#[derive(Debug, Clone)]
pub struct SqliteProgressStore {
    pool: SqlitePool,
    tier: Tier,
}

impl SqliteProgressStore {
    pub fn new(pool: SqlitePool, tier: Tier) -> Self {
        Self { pool, tier }
    }

    fn table(&self) -> &'static str {
        self.tier.table_name()
    }

    fn unavailable(&self, op: &str, e: sqlx::Error) -> Error {
        warn!("Progress {} failed on {}: {}", op, self.table(), e);
        Error::StoreUnavailable(format!("{} on '{}' tier: {}", op, self.tier, e))
    }
}

#[async_trait::async_trait]
impl ProgressStore for SqliteProgressStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn fetch_all(&self, user_id: &str) -> Result<Vec<CompletionRecord>> {
        let sql = format!(
            r#"
            SELECT user_id, learning_goal, current_course, current_module,
                   total_modules_in_course, is_completed, module_id
            FROM {}
            WHERE user_id = ?
            ORDER BY id
            "#,
            self.table()
        );

        sqlx::query_as::<_, CompletionRecord>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.unavailable("check", e))
    }

    async fn insert(&self, record: &CompletionRecord) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (user_id, learning_goal, current_course, current_module,
                            total_modules_in_course, is_completed, module_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            self.table()
        );

        sqlx::query(&sql)
            .bind(&record.user_id)
            .bind(&record.learning_goal)
            .bind(&record.current_course)
            .bind(&record.current_module)
            .bind(record.total_modules_in_course)
            .bind(record.is_completed)
            .bind(record.module_id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.unavailable("insert", e))?;

        debug!(
            "Inserted completion {}/{} for {} into {}",
            record.current_course,
            record.current_module,
            record.user_id,
            self.table()
        );
        Ok(())
    }

    async fn delete(
        &self,
        module_id: i64,
        user_id: &str,
        current_course: &str,
        current_module: &str,
    ) -> Result<u64> {
        let sql = format!(
            r#"
            DELETE FROM {}
            WHERE module_id = ? AND user_id = ? AND current_course = ? AND current_module = ?
            "#,
            self.table()
        );

        let result = sqlx::query(&sql)
            .bind(module_id)
            .bind(user_id)
            .bind(current_course)
            .bind(current_module)
            .execute(&self.pool)
            .await
            .map_err(|e| self.unavailable("delete", e))?;

        Ok(result.rows_affected())
    }
}
