//! Completion reconciler
//!
//! Turns "toggle this module" requests into inserts and deletes against one
//! tier's store, while keeping an in-memory mirror of completed modules that
//! the UI reads from.
//!
//! Per module the state machine is:
//!
//! ```text
//! Incomplete --toggle--> Completing --ok--> Complete
//!      ^                     |                  |
//!      +-------fail----------+               toggle
//!      |                                        v
//!      +-----------ok------- Uncompleting <-----+
//!                                |   fail -> Complete
//! ```
//!
//! The mirror is updated optimistically when a toggle is issued. Store
//! operations for one module run strictly in issue order through a ticket
//! queue. Every toggle carries a sequence number; when it resolves, only the
//! latest toggle for that module may change the visible state. Older resolutions only update
//! the record of what is actually persisted, which is what a failed latest
//! toggle rolls back to.
//!
//! Each toggle resolves on its own task, so a caller that stops waiting
//! (a dropped HTTP request) neither blocks the module's queue nor leaves the
//! module stuck in flight.

use crate::store::{check, StoreHandle};
use lumen_common::config::DuplicatePolicy;
use lumen_common::models::{CompletionRecord, ModuleKey};
use lumen_common::{Error, Result, Tier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-module reconciliation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Incomplete,
    /// Insert in flight
    Completing,
    Complete,
    /// Delete in flight
    Uncompleting,
}

impl ModuleState {
    /// Whether the UI should show the module as done
    pub fn shows_completed(&self) -> bool {
        matches!(self, ModuleState::Completing | ModuleState::Complete)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, ModuleState::Completing | ModuleState::Uncompleting)
    }

    fn settled(completed: bool) -> Self {
        if completed {
            ModuleState::Complete
        } else {
            ModuleState::Incomplete
        }
    }
}

/// Everything needed to write a completion row for one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleRequest {
    pub course_id: String,
    pub module_id: i64,
    pub total_modules_in_course: i64,
    pub learning_goal: String,
}

impl ToggleRequest {
    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(&self.course_id, self.module_id)
    }

    fn module_name(&self) -> String {
        self.module_id.to_string()
    }
}

/// How a resolved toggle related to the requests around it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleResolution {
    /// Latest toggle for the module; its result is now visible
    Applied,
    /// A newer toggle was issued before this one resolved
    Superseded,
}

/// Result of a toggle that did not fail visibly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleOutcome {
    pub key: ModuleKey,
    pub seq: u64,
    /// Requested direction: true for "mark complete"
    pub completed: bool,
    pub resolution: ToggleResolution,
    /// A new row was written
    pub inserted: bool,
    /// Rows removed by an uncomplete
    pub removed: u64,
    /// More than one row already existed for the module
    pub conflict: bool,
}

impl ToggleOutcome {
    pub fn is_applied(&self) -> bool {
        self.resolution == ToggleResolution::Applied
    }
}

#[derive(Debug, Default)]
struct PersistReport {
    inserted: bool,
    removed: u64,
    conflict: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct QueueTurns {
    issued: u64,
    serving: u64,
    /// Tickets given up before their turn came
    abandoned: BTreeSet<u64>,
}

/// FIFO of store-operation tickets for one module
#[derive(Debug)]
struct StoreQueue {
    turns: Mutex<QueueTurns>,
    serving: watch::Sender<u64>,
}

impl StoreQueue {
    fn new() -> Self {
        let (serving, _) = watch::channel(0);
        Self {
            turns: Mutex::new(QueueTurns::default()),
            serving,
        }
    }

    fn issue(self: &Arc<Self>) -> Ticket {
        let mut turns = lock(&self.turns);
        let number = turns.issued;
        turns.issued += 1;
        Ticket {
            queue: Arc::clone(self),
            number,
        }
    }

    /// Hand the turn on past `number` and any abandoned tickets behind it
    fn release(&self, number: u64) {
        let mut turns = lock(&self.turns);
        if number > turns.serving {
            turns.abandoned.insert(number);
            return;
        }
        if number < turns.serving {
            return;
        }
        let mut next = number + 1;
        while turns.abandoned.remove(&next) {
            next += 1;
        }
        turns.serving = next;
        self.serving.send_replace(next);
    }
}

/// A place in a module's store queue, released on drop whether or not it
/// was ever served
#[derive(Debug)]
struct Ticket {
    queue: Arc<StoreQueue>,
    number: u64,
}

impl Ticket {
    async fn wait_turn(&self) -> Result<()> {
        let mut serving = self.queue.serving.subscribe();
        serving
            .wait_for(|current| *current >= self.number)
            .await
            .map(|_| ())
            .map_err(|_| Error::Internal("toggle queue closed".to_string()))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.queue.release(self.number);
    }
}

#[derive(Debug)]
struct ModuleEntry {
    state: ModuleState,
    /// Last state confirmed by the store
    persisted: bool,
    /// Sequence number of the latest toggle issued for this module
    seq: u64,
    /// Value of `Mirror::resolutions` when a store write last succeeded
    touched: u64,
    /// A superseded completion wrote a row nobody has been rewarded for
    unrewarded_insert: bool,
    queue: Arc<StoreQueue>,
}

impl ModuleEntry {
    fn new(persisted: bool) -> Self {
        Self {
            state: ModuleState::settled(persisted),
            persisted,
            seq: 0,
            touched: 0,
            unrewarded_insert: false,
            queue: Arc::new(StoreQueue::new()),
        }
    }
}

#[derive(Debug, Default)]
struct Mirror {
    modules: HashMap<ModuleKey, ModuleEntry>,
    completed: BTreeSet<ModuleKey>,
    next_seq: u64,
    /// Count of successful store writes
    resolutions: u64,
}

impl Mirror {
    fn show(&mut self, key: &ModuleKey, completed: bool) {
        if completed {
            self.completed.insert(key.clone());
        } else {
            self.completed.remove(key);
        }
    }
}

/// State shared between a reconciler and its in-flight toggles
struct Shared {
    user_id: String,
    store: StoreHandle,
    policy: DuplicatePolicy,
    mirror: Mutex<Mirror>,
    cancel: CancellationToken,
}

impl Shared {
    fn mirror(&self) -> MutexGuard<'_, Mirror> {
        lock(&self.mirror)
    }

    fn cancelled(&self, request: &ToggleRequest) -> Error {
        Error::Cancelled(format!(
            "session for {} closed before {}/{} resolved",
            self.user_id, request.course_id, request.module_id
        ))
    }

    async fn persist(&self, request: &ToggleRequest, complete: bool) -> Result<PersistReport> {
        let module = request.module_name();

        if !complete {
            let removed = self
                .store
                .delete(request.module_id, &self.user_id, &request.course_id, &module)
                .await?;
            return Ok(PersistReport {
                removed,
                ..Default::default()
            });
        }

        let checked = check(self.store.as_ref(), &self.user_id).await;
        let existing = checked.matching(&request.course_id, &module).len();
        let conflict = existing > 1;
        if conflict {
            let err = Error::ReconciliationConflict(format!(
                "{} rows for {}/{} (user {}, '{}' tier)",
                existing,
                request.course_id,
                module,
                self.user_id,
                self.store.tier()
            ));
            warn!("{}", err);
        }

        if existing > 0 && self.policy == DuplicatePolicy::SkipExisting {
            info!(
                "Completion for {}/{} already persisted, skipping insert",
                request.course_id, module
            );
            return Ok(PersistReport {
                conflict,
                ..Default::default()
            });
        }

        let record = CompletionRecord {
            user_id: self.user_id.clone(),
            learning_goal: request.learning_goal.clone(),
            current_course: request.course_id.clone(),
            current_module: module,
            total_modules_in_course: request.total_modules_in_course,
            is_completed: true,
            module_id: request.module_id,
        };
        self.store.insert(&record).await?;

        Ok(PersistReport {
            inserted: true,
            removed: 0,
            conflict,
        })
    }
}

/// An issued toggle that has not resolved yet
///
/// Dropping it unresolved (session closed, task torn down) settles the
/// module back on its persisted state if this was the latest toggle.
struct PendingToggle {
    shared: Arc<Shared>,
    request: ToggleRequest,
    key: ModuleKey,
    seq: u64,
    target: bool,
    ticket: Ticket,
    resolved: bool,
}

impl PendingToggle {
    async fn resolve(mut self) -> Result<ToggleOutcome> {
        tokio::select! {
            ready = self.ticket.wait_turn() => ready?,
            _ = self.shared.cancel.cancelled() => {
                return Err(self.shared.cancelled(&self.request));
            }
        }

        // The store call always runs to completion; cancellation only stops
        // its result from being applied.
        let result = self.shared.persist(&self.request, self.target).await;

        if self.shared.cancel.is_cancelled() {
            return Err(self.shared.cancelled(&self.request));
        }
        self.settle(result)
    }

    fn settle(&mut self, result: Result<PersistReport>) -> Result<ToggleOutcome> {
        self.resolved = true;
        let (key, seq, target) = (&self.key, self.seq, self.target);

        let mut mirror = self.shared.mirror();
        if result.is_ok() {
            mirror.resolutions += 1;
        }
        let mark = mirror.resolutions;
        let Some(entry) = mirror.modules.get_mut(key) else {
            return Err(Error::Internal(format!(
                "module {}/{} vanished from mirror",
                key.course_id, key.module_id
            )));
        };
        let latest = entry.seq == seq;

        match result {
            Ok(report) => {
                entry.persisted = target;
                entry.touched = mark;
                if !target {
                    entry.unrewarded_insert = false;
                } else if report.inserted {
                    entry.unrewarded_insert = !latest;
                }

                // A latest toggle that ended unresolved already settled the
                // module; keep it following the store
                let visible = latest || !entry.state.is_in_flight();
                if visible {
                    entry.state = ModuleState::settled(target);
                    mirror.show(key, target);
                }
                if !latest {
                    debug!("Toggle #{} superseded, result recorded as persisted", seq);
                }

                Ok(ToggleOutcome {
                    key: key.clone(),
                    seq,
                    completed: target,
                    resolution: if latest {
                        ToggleResolution::Applied
                    } else {
                        ToggleResolution::Superseded
                    },
                    inserted: report.inserted,
                    removed: report.removed,
                    conflict: report.conflict,
                })
            }
            Err(e) if latest => {
                let persisted = entry.persisted;
                entry.state = ModuleState::settled(persisted);
                mirror.show(key, persisted);
                warn!(
                    "Toggle #{} for {}/{} failed, restored to {:?}: {}",
                    seq,
                    key.course_id,
                    key.module_id,
                    ModuleState::settled(persisted),
                    e
                );
                Err(e)
            }
            Err(e) => {
                debug!("Superseded toggle #{} failed: {}", seq, e);
                Ok(ToggleOutcome {
                    key: key.clone(),
                    seq,
                    completed: target,
                    resolution: ToggleResolution::Superseded,
                    inserted: false,
                    removed: 0,
                    conflict: false,
                })
            }
        }
    }
}

impl Drop for PendingToggle {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut mirror = self.shared.mirror();
        let Some(entry) = mirror.modules.get_mut(&self.key) else {
            return;
        };
        if entry.seq != self.seq {
            return;
        }
        let persisted = entry.persisted;
        entry.state = ModuleState::settled(persisted);
        mirror.show(&self.key, persisted);
        debug!(
            "Toggle #{} for {}/{} ended unresolved, showing {:?}",
            self.seq,
            self.key.course_id,
            self.key.module_id,
            ModuleState::settled(persisted)
        );
    }
}

/// Reconciler for one user's session against one tier
pub struct CompletionReconciler {
    shared: Arc<Shared>,
    /// Set once a hydrate succeeded
    hydrated: tokio::sync::Mutex<bool>,
}

impl CompletionReconciler {
    pub fn new(user_id: impl Into<String>, store: StoreHandle, policy: DuplicatePolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                user_id: user_id.into(),
                store,
                policy,
                mirror: Mutex::new(Mirror::default()),
                cancel: CancellationToken::new(),
            }),
            hydrated: tokio::sync::Mutex::new(false),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn tier(&self) -> Tier {
        self.shared.store.tier()
    }

    /// Load persisted completions into the mirror
    ///
    /// Modules with a toggle in flight keep their optimistic state, and
    /// modules whose store write succeeded after the snapshot was taken keep
    /// what that write recorded. Returns `false` when the store was
    /// unavailable, in which case the mirror is left untouched.
    pub async fn hydrate(&self) -> bool {
        let mark = self.shared.mirror().resolutions;
        let checked = check(self.shared.store.as_ref(), &self.shared.user_id).await;
        if checked.unavailable {
            return false;
        }

        let persisted: BTreeSet<ModuleKey> = checked
            .records
            .iter()
            .filter(|r| r.is_completed)
            .map(CompletionRecord::key)
            .collect();

        let mut mirror = self.shared.mirror();
        for key in &persisted {
            mirror
                .modules
                .entry(key.clone())
                .or_insert_with(|| ModuleEntry::new(true));
        }

        let mut visible = Vec::new();
        let mut newer = 0;
        for (key, entry) in mirror.modules.iter_mut() {
            if entry.touched > mark {
                newer += 1;
                continue;
            }
            entry.persisted = persisted.contains(key);
            if !entry.persisted {
                entry.unrewarded_insert = false;
            }
            if !entry.state.is_in_flight() {
                entry.state = ModuleState::settled(entry.persisted);
                visible.push((key.clone(), entry.persisted));
            }
        }
        for (key, completed) in visible {
            mirror.show(&key, completed);
        }

        debug!(
            "Hydrated {} completions for {} from '{}' tier ({} modules newer than snapshot)",
            persisted.len(),
            self.shared.user_id,
            self.tier(),
            newer
        );
        true
    }

    /// Hydrate unless an earlier call already succeeded
    ///
    /// Concurrent callers wait for the one that is hydrating. Returns
    /// whether the mirror has been hydrated from the store.
    pub async fn ensure_hydrated(&self) -> bool {
        let mut hydrated = self.hydrated.lock().await;
        if !*hydrated {
            *hydrated = self.hydrate().await;
        }
        *hydrated
    }

    /// Current state of one module
    pub async fn state(&self, key: &ModuleKey) -> ModuleState {
        self.shared
            .mirror()
            .modules
            .get(key)
            .map(|e| e.state)
            .unwrap_or(ModuleState::Incomplete)
    }

    pub async fn is_completed(&self, key: &ModuleKey) -> bool {
        self.shared.mirror().completed.contains(key)
    }

    /// Completed module ids for a course, ascending
    pub async fn completed_modules(&self, course_id: &str) -> Vec<i64> {
        self.shared
            .mirror()
            .completed
            .iter()
            .filter(|k| k.course_id == course_id)
            .map(|k| k.module_id)
            .collect()
    }

    /// Module ids whose last persisted state is "complete", ascending
    pub async fn persisted_modules(&self, course_id: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .shared
            .mirror()
            .modules
            .iter()
            .filter(|(k, e)| k.course_id == course_id && e.persisted)
            .map(|(k, _)| k.module_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Claim the row a superseded completion wrote, if nobody was rewarded
    /// for it and the module has settled as complete
    ///
    /// Returns `true` at most once per such row.
    pub async fn take_unrewarded_insert(&self, key: &ModuleKey) -> bool {
        let mut mirror = self.shared.mirror();
        match mirror.modules.get_mut(key) {
            Some(entry)
                if entry.unrewarded_insert
                    && entry.persisted
                    && entry.state == ModuleState::Complete =>
            {
                entry.unrewarded_insert = false;
                true
            }
            _ => false,
        }
    }

    /// Stop applying results; in-flight toggles resolve as cancelled
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Flip a module between complete and incomplete
    ///
    /// Returns [`Error::StoreUnavailable`] when the latest toggle for the
    /// module failed (the mirror has been restored to the persisted state),
    /// or [`Error::Cancelled`] when the session was closed first. The toggle
    /// keeps resolving if the returned future is dropped.
    pub async fn toggle(&self, request: &ToggleRequest) -> Result<ToggleOutcome> {
        if self.is_closed() {
            return Err(self.shared.cancelled(request));
        }

        let pending = self.issue(request);
        debug!(
            "Toggle #{} {}/{} -> {} for {}",
            pending.seq,
            pending.key.course_id,
            pending.key.module_id,
            if pending.target { "complete" } else { "incomplete" },
            self.shared.user_id
        );

        tokio::spawn(pending.resolve())
            .await
            .map_err(|e| Error::Internal(format!("toggle task failed: {}", e)))?
    }

    fn issue(&self, request: &ToggleRequest) -> PendingToggle {
        let key = request.key();
        let mut mirror = self.shared.mirror();
        mirror.next_seq += 1;
        let seq = mirror.next_seq;

        let entry = mirror
            .modules
            .entry(key.clone())
            .or_insert_with(|| ModuleEntry::new(false));
        let target = !entry.state.shows_completed();
        entry.state = if target {
            ModuleState::Completing
        } else {
            ModuleState::Uncompleting
        };
        entry.seq = seq;
        // Tickets are taken under the mirror lock so store operations
        // run in exactly the order toggles were issued
        let ticket = entry.queue.issue();

        mirror.show(&key, target);
        PendingToggle {
            shared: Arc::clone(&self.shared),
            request: request.clone(),
            key,
            seq,
            target,
            ticket,
            resolved: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteProgressStore;
    use lumen_common::db::init_in_memory;

    async fn reconciler(policy: DuplicatePolicy) -> (CompletionReconciler, StoreHandle) {
        let pool = init_in_memory().await.unwrap();
        let store: StoreHandle = Arc::new(SqliteProgressStore::new(pool, Tier::Minimal));
        (
            CompletionReconciler::new("user-1", Arc::clone(&store), policy),
            store,
        )
    }

    fn request(module_id: i64) -> ToggleRequest {
        ToggleRequest {
            course_id: "html-css-mastery".to_string(),
            module_id,
            total_modules_in_course: 8,
            learning_goal: "web-development".to_string(),
        }
    }

    #[tokio::test]
    async fn test_abandoned_ticket_passes_turn_on() {
        let queue = Arc::new(StoreQueue::new());
        let first = queue.issue();
        let second = queue.issue();
        let third = queue.issue();

        // Giving up a later ticket does not jump the queue
        drop(second);
        assert_eq!(*queue.serving.borrow(), 0);

        drop(first);
        assert_eq!(*queue.serving.borrow(), 2);
        tokio::time::timeout(std::time::Duration::from_secs(1), third.wait_turn())
            .await
            .expect("third ticket should be served")
            .unwrap();
    }

    #[test]
    fn test_state_flags() {
        assert!(ModuleState::Completing.shows_completed());
        assert!(ModuleState::Complete.shows_completed());
        assert!(!ModuleState::Uncompleting.shows_completed());
        assert!(ModuleState::Uncompleting.is_in_flight());
        assert!(!ModuleState::Incomplete.is_in_flight());
    }

    #[tokio::test]
    async fn test_toggle_complete_inserts_one_row() {
        let (rec, store) = reconciler(DuplicatePolicy::SkipExisting).await;

        let outcome = rec.toggle(&request(1)).await.unwrap();
        assert!(outcome.is_applied());
        assert!(outcome.completed);
        assert!(outcome.inserted);

        assert_eq!(rec.state(&request(1).key()).await, ModuleState::Complete);
        assert_eq!(rec.completed_modules("html-css-mastery").await, vec![1]);

        let rows = store.fetch_all("user-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].current_module, "1");
        assert_eq!(rows[0].total_modules_in_course, 8);
    }

    #[tokio::test]
    async fn test_toggle_twice_removes_row() {
        let (rec, store) = reconciler(DuplicatePolicy::SkipExisting).await;

        rec.toggle(&request(1)).await.unwrap();
        let outcome = rec.toggle(&request(1)).await.unwrap();
        assert!(!outcome.completed);
        assert_eq!(outcome.removed, 1);

        assert!(!rec.is_completed(&request(1).key()).await);
        assert!(store.fetch_all("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skip_existing_does_not_duplicate() {
        let (rec, store) = reconciler(DuplicatePolicy::SkipExisting).await;
        // Row written by another device; this session has not hydrated yet
        store
            .insert(&CompletionRecord {
                user_id: "user-1".into(),
                learning_goal: "web-development".into(),
                current_course: "html-css-mastery".into(),
                current_module: "2".into(),
                total_modules_in_course: 8,
                is_completed: true,
                module_id: 2,
            })
            .await
            .unwrap();

        let outcome = rec.toggle(&request(2)).await.unwrap();
        assert!(!outcome.inserted);
        assert_eq!(store.fetch_all("user-1").await.unwrap().len(), 1);
        assert!(rec.is_completed(&request(2).key()).await);
    }

    #[tokio::test]
    async fn test_insert_always_appends() {
        let (rec, store) = reconciler(DuplicatePolicy::InsertAlways).await;
        rec.toggle(&request(3)).await.unwrap();
        rec.toggle(&request(3)).await.unwrap();
        rec.toggle(&request(3)).await.unwrap();

        // complete, uncomplete (removes all), complete
        assert_eq!(store.fetch_all("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hydrate_loads_persisted_rows() {
        let (rec, store) = reconciler(DuplicatePolicy::SkipExisting).await;
        let writer = CompletionReconciler::new("user-1", Arc::clone(&store), DuplicatePolicy::SkipExisting);
        writer.toggle(&request(4)).await.unwrap();
        writer.toggle(&request(6)).await.unwrap();

        assert!(rec.completed_modules("html-css-mastery").await.is_empty());
        assert!(rec.hydrate().await);
        assert_eq!(rec.completed_modules("html-css-mastery").await, vec![4, 6]);
        assert_eq!(rec.persisted_modules("html-css-mastery").await, vec![4, 6]);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_toggle() {
        let (rec, store) = reconciler(DuplicatePolicy::SkipExisting).await;
        rec.close();

        let err = rec.toggle(&request(1)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(store.fetch_all("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_toggles_converge() {
        let (rec, store) = reconciler(DuplicatePolicy::SkipExisting).await;
        let rec = Arc::new(rec);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let rec = Arc::clone(&rec);
                tokio::spawn(async move { rec.toggle(&request(7)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Odd number of toggles ends complete, with exactly one row
        let rows = store.fetch_all("user-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rec.is_completed(&request(7).key()).await);
        assert_eq!(rec.state(&request(7).key()).await, ModuleState::Complete);
    }
}
