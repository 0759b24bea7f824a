//! Progress store adapter
//!
//! One interface over the four tier partitions. Every tier exposes the same
//! check/insert/delete operations; the [`TierSelector`] picks which one a
//! request talks to.

mod selector;
mod sqlite;

pub use selector::TierSelector;
pub use sqlite::SqliteProgressStore;

use lumen_common::models::CompletionRecord;
use lumen_common::{Result, Tier};
use std::sync::Arc;
use tracing::warn;

/// Completion-record storage for a single tier
///
/// The adapter does not enforce uniqueness; callers check before inserting.
/// Failures surface as [`lumen_common::Error::StoreUnavailable`] and are
/// never retried here.
#[async_trait::async_trait]
pub trait ProgressStore: Send + Sync {
    /// Tier whose partition this store reads and writes
    fn tier(&self) -> Tier;

    /// All completion rows for `user_id` in this partition
    async fn fetch_all(&self, user_id: &str) -> Result<Vec<CompletionRecord>>;

    /// Append a row (no upsert)
    async fn insert(&self, record: &CompletionRecord) -> Result<()>;

    /// Remove matching rows, returning how many were removed
    ///
    /// Zero matches is not an error.
    async fn delete(
        &self,
        module_id: i64,
        user_id: &str,
        current_course: &str,
        current_module: &str,
    ) -> Result<u64>;
}

/// Shared handle to one tier's store
pub type StoreHandle = Arc<dyn ProgressStore>;

/// Outcome of [`check`]
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub records: Vec<CompletionRecord>,
    /// The store failed and `records` is empty because of it
    pub unavailable: bool,
}

impl CheckResult {
    /// Rows for one course/module pair
    pub fn matching(&self, course: &str, module: &str) -> Vec<&CompletionRecord> {
        self.records
            .iter()
            .filter(|r| r.matches(course, module))
            .collect()
    }
}

/// Fetch a user's rows, degrading to an empty list on store failure
///
/// An empty list from a failed store looks the same as one from a user
/// with no progress; `unavailable` is the only way to tell them apart.
pub async fn check(store: &dyn ProgressStore, user_id: &str) -> CheckResult {
    match store.fetch_all(user_id).await {
        Ok(records) => CheckResult {
            records,
            unavailable: false,
        },
        Err(e) => {
            warn!(
                "Progress check failed for user {} in '{}' tier: {}",
                user_id,
                store.tier(),
                e
            );
            CheckResult {
                records: Vec::new(),
                unavailable: true,
            }
        }
    }
}
