//! Progress service
//!
//! Ties the pieces together for the HTTP layer: one [`CompletionReconciler`]
//! per (user, tier) session, the catalog for module metadata, and the stats
//! aggregator for everything derived from a completion.

use crate::aggregator::{StatsAggregator, REASON_VIDEO};
use crate::reconciler::{CompletionReconciler, ToggleOutcome, ToggleRequest};
use crate::store::TierSelector;
use lumen_common::catalog::{CatalogProvider, ModuleCatalogEntry};
use lumen_common::config::DuplicatePolicy;
use lumen_common::events::{EventBus, ProgressEvent};
use lumen_common::levels::compute_percent_complete;
use lumen_common::models::UserStats;
use lumen_common::{time, Error, Result, Tier};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Learning goal recorded when the user has not completed onboarding
pub const DEFAULT_LEARNING_GOAL: &str = "general";

/// Notice shown when a toggle could not be saved
const TOGGLE_FAILED_NOTICE: &str = "Your progress could not be saved. Please try again.";

/// A course's progress within one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseProgress {
    pub user_id: String,
    pub course_id: String,
    pub tier: Tier,
    pub completed_modules: Vec<i64>,
    pub total_modules: usize,
    pub percent_complete: u8,
    /// The tier's store could not be read; completions may be missing
    pub store_unavailable: bool,
}

/// Result of a toggle as reported to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToggleReport {
    #[serde(flatten)]
    pub outcome: ToggleOutcome,
    pub tier: Tier,
    pub percent_complete: u8,
    /// Stats after side effects, when the toggle applied and they succeeded
    pub stats: Option<UserStats>,
}

/// Session registry plus toggle orchestration
pub struct ProgressService {
    selector: TierSelector,
    aggregator: Arc<StatsAggregator>,
    catalog: Arc<dyn CatalogProvider>,
    events: EventBus,
    policy: DuplicatePolicy,
    sessions: Mutex<HashMap<(String, Tier), Arc<CompletionReconciler>>>,
}

impl ProgressService {
    pub fn new(
        selector: TierSelector,
        aggregator: Arc<StatsAggregator>,
        catalog: Arc<dyn CatalogProvider>,
        events: EventBus,
        policy: DuplicatePolicy,
    ) -> Self {
        Self {
            selector,
            aggregator,
            catalog,
            events,
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn aggregator(&self) -> &StatsAggregator {
        &self.aggregator
    }

    pub fn catalog(&self) -> &dyn CatalogProvider {
        self.catalog.as_ref()
    }

    /// Tier for a raw query value; unknown or missing values use the default
    pub fn resolve_tier(&self, raw: Option<&str>) -> Tier {
        self.selector.resolve(raw)
    }

    /// Reconciler for a session, created and hydrated on first use
    ///
    /// Hydration is retried on later calls until the store answers once.
    pub async fn session(&self, user_id: &str, tier: Tier) -> Arc<CompletionReconciler> {
        self.hydrated_session(user_id, tier).await.0
    }

    /// Session reconciler plus whether it has been hydrated
    async fn hydrated_session(
        &self,
        user_id: &str,
        tier: Tier,
    ) -> (Arc<CompletionReconciler>, bool) {
        let reconciler = {
            let mut sessions = self.sessions.lock().await;
            let reconciler = sessions
                .entry((user_id.to_string(), tier))
                .or_insert_with(|| {
                    debug!("Opening '{}' tier session for {}", tier, user_id);
                    Arc::new(CompletionReconciler::new(
                        user_id,
                        self.selector.select_store(tier),
                        self.policy,
                    ))
                });
            Arc::clone(reconciler)
        };

        let hydrated = reconciler.ensure_hydrated().await;
        (reconciler, hydrated)
    }

    /// Close a session; in-flight toggles stop applying their results
    ///
    /// Returns `false` when no such session was open.
    pub async fn close_session(&self, user_id: &str, tier: Tier) -> bool {
        let removed = self
            .sessions
            .lock()
            .await
            .remove(&(user_id.to_string(), tier));
        match removed {
            Some(reconciler) => {
                reconciler.close();
                info!("Closed '{}' tier session for {}", tier, user_id);
                true
            }
            None => false,
        }
    }

    pub async fn open_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Completed modules and percent complete for one course
    pub async fn progress(
        &self,
        user_id: &str,
        course_id: &str,
        tier: Tier,
    ) -> Result<CourseProgress> {
        let modules = self.catalog.get_modules(course_id)?;
        let (reconciler, hydrated) = self.hydrated_session(user_id, tier).await;
        let store_unavailable = !hydrated;

        let completed_modules: Vec<i64> = reconciler
            .completed_modules(course_id)
            .await
            .into_iter()
            .filter(|id| modules.iter().any(|m| m.id == *id))
            .collect();

        Ok(CourseProgress {
            user_id: user_id.to_string(),
            course_id: course_id.to_string(),
            tier,
            percent_complete: compute_percent_complete(completed_modules.len(), modules.len()),
            completed_modules,
            total_modules: modules.len(),
            store_unavailable,
        })
    }

    /// Flip a module's completion and run the derived updates
    ///
    /// Points, watch time and streak are touched by an applied completion
    /// that wrote a new row, or by a latest toggle that settled on a row an
    /// earlier superseded completion wrote. Enrollment is recomputed whenever
    /// the latest toggle resolves, including when it failed. Failures of
    /// those follow-up writes are logged and do not undo the toggle.
    pub async fn toggle(
        &self,
        user_id: &str,
        course_id: &str,
        module_id: i64,
        tier: Tier,
    ) -> Result<ToggleReport> {
        let modules = self.catalog.get_modules(course_id)?;
        let module = modules
            .iter()
            .find(|m| m.id == module_id)
            .ok_or_else(|| {
                Error::NotFound(format!("module {} in course '{}'", module_id, course_id))
            })?;
        let learning_goal = self.learning_goal(user_id).await;

        let request = ToggleRequest {
            course_id: course_id.to_string(),
            module_id,
            total_modules_in_course: modules.len() as i64,
            learning_goal,
        };
        let key = request.key();

        let reconciler = self.session(user_id, tier).await;
        let outcome = match reconciler.toggle(&request).await {
            Ok(outcome) => outcome,
            Err(e @ Error::StoreUnavailable(_)) => {
                self.events.emit_lossy(ProgressEvent::ToggleFailed {
                    user_id: user_id.to_string(),
                    course_id: course_id.to_string(),
                    module_id,
                    message: TOGGLE_FAILED_NOTICE.to_string(),
                    timestamp: time::now(),
                });

                // Restored state may be a row a superseded completion wrote
                let rewarded = reconciler.take_unrewarded_insert(&key).await;
                let completed_count =
                    completed_in_course(&reconciler, course_id, &modules).await;
                if let Err(follow_up) = self
                    .apply_side_effects(
                        user_id,
                        course_id,
                        rewarded,
                        module.duration_minutes,
                        completed_count,
                        modules.len(),
                    )
                    .await
                {
                    warn!(
                        "Stats update after failed toggle of {}/{} failed for {}: {}",
                        course_id, module_id, user_id, follow_up
                    );
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let completed_count = completed_in_course(&reconciler, course_id, &modules).await;
        let percent_complete = compute_percent_complete(completed_count, modules.len());

        if !outcome.is_applied() {
            return Ok(ToggleReport {
                outcome,
                tier,
                percent_complete,
                stats: None,
            });
        }

        let event = if outcome.completed {
            ProgressEvent::ModuleCompleted {
                user_id: user_id.to_string(),
                tier,
                course_id: course_id.to_string(),
                module_id,
                timestamp: time::now(),
            }
        } else {
            ProgressEvent::ModuleUncompleted {
                user_id: user_id.to_string(),
                tier,
                course_id: course_id.to_string(),
                module_id,
                timestamp: time::now(),
            }
        };
        self.events.emit_lossy(event);

        // Rows skipped as already present were rewarded when first written
        let carried = reconciler.take_unrewarded_insert(&key).await;
        let rewarded = outcome.completed && (outcome.inserted || carried);

        let stats = match self
            .apply_side_effects(
                user_id,
                course_id,
                rewarded,
                module.duration_minutes,
                completed_count,
                modules.len(),
            )
            .await
        {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(
                    "Progress for {}/{} saved but stats update failed for {}: {}",
                    course_id, module_id, user_id, e
                );
                None
            }
        };

        Ok(ToggleReport {
            outcome,
            tier,
            percent_complete,
            stats,
        })
    }

    async fn apply_side_effects(
        &self,
        user_id: &str,
        course_id: &str,
        rewarded_completion: bool,
        duration_minutes: i64,
        completed_count: usize,
        total_modules: usize,
    ) -> Result<UserStats> {
        if rewarded_completion {
            let video_points = self.aggregator.points_policy().video_completion;
            if video_points > 0 {
                self.aggregator
                    .award_points(user_id, video_points, REASON_VIDEO)
                    .await?;
            }
            self.aggregator
                .record_video_watched(user_id, duration_minutes)
                .await?;
            self.aggregator.update_streak(user_id, time::today()).await?;
        }

        self.aggregator
            .recompute_enrollment(user_id, course_id, completed_count, total_modules)
            .await?;

        self.aggregator.get_stats(user_id).await
    }

    async fn learning_goal(&self, user_id: &str) -> String {
        match self.aggregator.get_profile(user_id).await {
            Ok(profile) => profile
                .learning_goal
                .filter(|g| !g.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LEARNING_GOAL.to_string()),
            Err(Error::NotFound(_)) => DEFAULT_LEARNING_GOAL.to_string(),
            Err(e) => {
                warn!("Could not load profile for {}: {}", user_id, e);
                DEFAULT_LEARNING_GOAL.to_string()
            }
        }
    }
}

/// Completed modules the mirror shows for a course, limited to catalog modules
async fn completed_in_course(
    reconciler: &CompletionReconciler,
    course_id: &str,
    modules: &[ModuleCatalogEntry],
) -> usize {
    reconciler
        .completed_modules(course_id)
        .await
        .into_iter()
        .filter(|id| modules.iter().any(|m| m.id == *id))
        .count()
}
