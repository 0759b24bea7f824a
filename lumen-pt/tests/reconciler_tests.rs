//! Reconciler behavior against a controllable store
//!
//! Tests cover:
//! - Rollback when the latest toggle's store write fails
//! - Out-of-order resolution: superseded toggles never change visible state
//! - Mirror and store agree once every toggle has resolved
//! - Session close while a store write is in flight
//! - A caller that stops waiting does not stall the module
//! - Hydration racing a toggle, and hydrating once per session
//! - Rows written by superseded completions are handed over for rewards

use async_trait::async_trait;
use lumen_common::config::DuplicatePolicy;
use lumen_common::models::{CompletionRecord, ModuleKey};
use lumen_common::{Error, Result, Tier};
use lumen_pt::reconciler::{CompletionReconciler, ModuleState, ToggleRequest, ToggleResolution};
use lumen_pt::store::ProgressStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// In-memory store with switchable failures and gates on writes and fetches
struct ControlledStore {
    rows: Mutex<Vec<CompletionRecord>>,
    fail_fetch: AtomicBool,
    fail_writes: AtomicBool,
    gated: AtomicBool,
    gate: Semaphore,
    write_started: Notify,
    /// Hold the next fetch after it has read its rows
    hold_next_fetch: AtomicBool,
    fetch_gate: Semaphore,
    fetch_started: Notify,
    fetches: AtomicUsize,
}

impl ControlledStore {
    fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            fail_fetch: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            write_started: Notify::new(),
            hold_next_fetch: AtomicBool::new(false),
            fetch_gate: Semaphore::new(0),
            fetch_started: Notify::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn hold_writes(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    fn release_writes(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    async fn enter_write(&self) -> Result<()> {
        self.write_started.notify_one();
        if self.gated.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for ControlledStore {
    fn tier(&self) -> Tier {
        Tier::Moderate
    }

    async fn fetch_all(&self, user_id: &str) -> Result<Vec<CompletionRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("injected fetch failure".to_string()));
        }
        let snapshot: Vec<CompletionRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();

        if self.hold_next_fetch.swap(false, Ordering::SeqCst) {
            self.fetch_started.notify_one();
            let permit = self.fetch_gate.acquire().await.unwrap();
            permit.forget();
        }
        Ok(snapshot)
    }

    async fn insert(&self, record: &CompletionRecord) -> Result<()> {
        self.enter_write().await?;
        self.rows.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn delete(
        &self,
        module_id: i64,
        user_id: &str,
        current_course: &str,
        current_module: &str,
    ) -> Result<u64> {
        self.enter_write().await?;
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| {
            !(r.module_id == module_id
                && r.user_id == user_id
                && r.matches(current_course, current_module))
        });
        Ok((before - rows.len()) as u64)
    }
}

fn setup() -> (Arc<ControlledStore>, Arc<CompletionReconciler>) {
    let store = Arc::new(ControlledStore::new());
    let reconciler = Arc::new(CompletionReconciler::new(
        "user-1",
        store.clone(),
        DuplicatePolicy::SkipExisting,
    ));
    (store, reconciler)
}

fn request(module_id: i64) -> ToggleRequest {
    ToggleRequest {
        course_id: "html-css-mastery".to_string(),
        module_id,
        total_modules_in_course: 8,
        learning_goal: "web-development".to_string(),
    }
}

fn key(module_id: i64) -> ModuleKey {
    ModuleKey::new("html-css-mastery", module_id)
}

/// Wait until the spawned toggle has issued and reached the store
async fn wait_for_write(store: &ControlledStore) {
    tokio::time::timeout(Duration::from_secs(5), store.write_started.notified())
        .await
        .expect("toggle should reach the store");
}

/// Wait until a second toggle has been issued (mirror flipped)
async fn wait_for_state(reconciler: &CompletionReconciler, state: ModuleState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while reconciler.state(&key(1)).await != state {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("module should reach expected state");
}

#[tokio::test]
async fn test_failed_insert_rolls_back() {
    let (store, reconciler) = setup();
    store.fail_writes.store(true, Ordering::SeqCst);

    let result = reconciler.toggle(&request(1)).await;
    assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    assert_eq!(reconciler.state(&key(1)).await, ModuleState::Incomplete);
    assert!(!reconciler.is_completed(&key(1)).await);
    assert_eq!(store.row_count(), 0);
}

#[tokio::test]
async fn test_failed_delete_rolls_back() {
    let (store, reconciler) = setup();
    reconciler.toggle(&request(1)).await.unwrap();

    store.fail_writes.store(true, Ordering::SeqCst);
    let result = reconciler.toggle(&request(1)).await;
    assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    assert_eq!(reconciler.state(&key(1)).await, ModuleState::Complete);
    assert!(reconciler.is_completed(&key(1)).await);
    assert_eq!(store.row_count(), 1);
}

#[tokio::test]
async fn test_stale_success_does_not_override_newer_toggle() {
    let (store, reconciler) = setup();
    store.hold_writes();

    let first = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.toggle(&request(1)).await }
    });
    wait_for_write(&store).await;

    let second = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.toggle(&request(1)).await }
    });
    wait_for_state(&reconciler, ModuleState::Uncompleting).await;
    assert!(!reconciler.is_completed(&key(1)).await);

    store.release_writes();
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first.resolution, ToggleResolution::Superseded);
    assert_eq!(second.resolution, ToggleResolution::Applied);
    assert!(!second.completed);
    assert_eq!(second.removed, 1);

    assert_eq!(reconciler.state(&key(1)).await, ModuleState::Incomplete);
    assert_eq!(store.row_count(), 0);
    // The superseded insert was deleted again; nothing to reward
    assert!(!reconciler.take_unrewarded_insert(&key(1)).await);
}

#[tokio::test]
async fn test_latest_failure_restores_what_stale_toggle_persisted() {
    let (store, reconciler) = setup();
    store.hold_writes();

    let first = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.toggle(&request(1)).await }
    });
    wait_for_write(&store).await;

    let second = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.toggle(&request(1)).await }
    });
    wait_for_state(&reconciler, ModuleState::Uncompleting).await;

    // Let the insert through, then fail the delete that follows it
    store.gate.add_permits(1);
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.resolution, ToggleResolution::Superseded);
    assert!(first.inserted);

    store.fail_writes.store(true, Ordering::SeqCst);
    store.gate.add_permits(1);
    let second = second.await.unwrap();
    assert!(matches!(second, Err(Error::StoreUnavailable(_))));

    // Mirror converges on the row that actually exists
    assert_eq!(reconciler.state(&key(1)).await, ModuleState::Complete);
    assert!(reconciler.is_completed(&key(1)).await);
    assert_eq!(store.row_count(), 1);
    assert_eq!(
        reconciler.persisted_modules("html-css-mastery").await,
        vec![1]
    );

    // The row written by the superseded completion is handed over exactly once
    assert!(reconciler.take_unrewarded_insert(&key(1)).await);
    assert!(!reconciler.take_unrewarded_insert(&key(1)).await);
}

#[tokio::test]
async fn test_stale_failure_is_ignored() {
    let (store, reconciler) = setup();
    store.hold_writes();
    store.fail_writes.store(true, Ordering::SeqCst);

    let first = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.toggle(&request(1)).await }
    });
    wait_for_write(&store).await;

    let second = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.toggle(&request(1)).await }
    });
    wait_for_state(&reconciler, ModuleState::Uncompleting).await;

    // The held insert fails; the delete after it succeeds
    store.gate.add_permits(1);
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.resolution, ToggleResolution::Superseded);
    assert!(!first.inserted);

    store.fail_writes.store(false, Ordering::SeqCst);
    store.gate.add_permits(1);
    let second = second.await.unwrap().unwrap();
    assert_eq!(second.resolution, ToggleResolution::Applied);

    assert_eq!(reconciler.state(&key(1)).await, ModuleState::Incomplete);
    assert_eq!(store.row_count(), 0);
}

#[tokio::test]
async fn test_close_while_in_flight_returns_cancelled() {
    let (store, reconciler) = setup();
    store.hold_writes();

    let pending = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.toggle(&request(1)).await }
    });
    wait_for_write(&store).await;

    reconciler.close();
    store.release_writes();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled(_))));
    // The write itself completed
    assert_eq!(store.row_count(), 1);

    assert!(matches!(
        reconciler.toggle(&request(2)).await,
        Err(Error::Cancelled(_))
    ));
}

#[tokio::test]
async fn test_hydrate_reports_unavailable_store() {
    let (store, reconciler) = setup();
    store.fail_fetch.store(true, Ordering::SeqCst);
    assert!(!reconciler.hydrate().await);

    store.fail_fetch.store(false, Ordering::SeqCst);
    assert!(reconciler.hydrate().await);
    assert!(reconciler.completed_modules("html-css-mastery").await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rapid_toggles_converge_with_store() {
    let (store, reconciler) = setup();

    let mut handles = Vec::new();
    for _ in 0..7 {
        let reconciler = reconciler.clone();
        handles.push(tokio::spawn(async move {
            reconciler.toggle(&request(3)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Odd number of toggles from Incomplete ends Complete with one row
    assert_eq!(reconciler.state(&key(3)).await, ModuleState::Complete);
    assert_eq!(store.row_count(), 1);
    assert_eq!(
        reconciler.completed_modules("html-css-mastery").await,
        reconciler.persisted_modules("html-css-mastery").await
    );
}

#[tokio::test]
async fn test_applied_insert_is_not_handed_over_again() {
    let (store, reconciler) = setup();
    let outcome = reconciler.toggle(&request(1)).await.unwrap();
    assert!(outcome.is_applied());
    assert!(outcome.inserted);
    assert_eq!(store.row_count(), 1);

    assert!(!reconciler.take_unrewarded_insert(&key(1)).await);
}

#[tokio::test]
async fn test_dropped_queued_toggle_does_not_block_module() {
    let (store, reconciler) = setup();
    store.hold_writes();

    let first = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.toggle(&request(1)).await }
    });
    wait_for_write(&store).await;

    let second = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.toggle(&request(1)).await }
    });
    wait_for_state(&reconciler, ModuleState::Uncompleting).await;

    // The caller of the queued toggle goes away
    second.abort();
    assert!(second.await.unwrap_err().is_cancelled());

    store.release_writes();
    first.await.unwrap().unwrap();

    let third = tokio::time::timeout(Duration::from_secs(2), reconciler.toggle(&request(1)))
        .await
        .expect("toggle after an abandoned caller should resolve")
        .unwrap();
    assert!(third.is_applied());
    assert!(third.completed);

    assert_eq!(reconciler.state(&key(1)).await, ModuleState::Complete);
    assert!(reconciler.is_completed(&key(1)).await);
    assert_eq!(store.row_count(), 1);
}

#[tokio::test]
async fn test_dropped_in_flight_toggle_still_resolves() {
    let (store, reconciler) = setup();
    store.hold_writes();

    // Caller gives up while the insert is held
    let gave_up =
        tokio::time::timeout(Duration::from_millis(50), reconciler.toggle(&request(1))).await;
    assert!(gave_up.is_err());
    assert_eq!(reconciler.state(&key(1)).await, ModuleState::Completing);

    store.release_writes();
    wait_for_state(&reconciler, ModuleState::Complete).await;
    assert_eq!(store.row_count(), 1);
    assert_eq!(
        reconciler.persisted_modules("html-css-mastery").await,
        vec![1]
    );
}

#[tokio::test]
async fn test_hydrate_keeps_toggle_resolved_after_snapshot() {
    let (store, reconciler) = setup();
    store.hold_next_fetch.store(true, Ordering::SeqCst);

    let hydrating = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.hydrate().await }
    });
    tokio::time::timeout(Duration::from_secs(5), store.fetch_started.notified())
        .await
        .expect("hydrate should reach the store");

    // Snapshot is empty; the toggle lands while hydrate is still holding it
    let outcome = reconciler.toggle(&request(1)).await.unwrap();
    assert!(outcome.is_applied());
    assert!(outcome.inserted);

    store.fetch_gate.add_permits(1);
    assert!(hydrating.await.unwrap());

    assert!(reconciler.is_completed(&key(1)).await);
    assert_eq!(reconciler.state(&key(1)).await, ModuleState::Complete);
    assert_eq!(store.row_count(), 1);
    assert_eq!(
        reconciler.persisted_modules("html-css-mastery").await,
        vec![1]
    );
}

#[tokio::test]
async fn test_concurrent_first_use_hydrates_once() {
    let (store, reconciler) = setup();
    store.hold_next_fetch.store(true, Ordering::SeqCst);

    let first = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.ensure_hydrated().await }
    });
    tokio::time::timeout(Duration::from_secs(5), store.fetch_started.notified())
        .await
        .expect("hydrate should reach the store");
    let second = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.ensure_hydrated().await }
    });
    tokio::task::yield_now().await;

    store.fetch_gate.add_permits(1);
    assert!(first.await.unwrap());
    assert!(second.await.unwrap());
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);

    // Later calls do not go back to the store
    assert!(reconciler.ensure_hydrated().await);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_hydrate_is_retried() {
    let (store, reconciler) = setup();
    store.fail_fetch.store(true, Ordering::SeqCst);
    assert!(!reconciler.ensure_hydrated().await);

    store.fail_fetch.store(false, Ordering::SeqCst);
    assert!(reconciler.ensure_hydrated().await);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
}
