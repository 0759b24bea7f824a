//! Event types for Lumen event system
//!
//! Provides shared progress event definitions and EventBus for all Lumen services.

use crate::streak::StreakChange;
use crate::tier::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lumen progress events
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    /// A module completion was persisted
    ModuleCompleted {
        user_id: String,
        tier: Tier,
        course_id: String,
        module_id: i64,
        timestamp: DateTime<Utc>,
    },

    /// A module completion was removed
    ModuleUncompleted {
        user_id: String,
        tier: Tier,
        course_id: String,
        module_id: i64,
        timestamp: DateTime<Utc>,
    },

    /// A toggle failed and local state was restored
    ToggleFailed {
        user_id: String,
        course_id: String,
        module_id: i64,
        /// User-facing notice
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Points were added to a user's total
    PointsAwarded {
        user_id: String,
        points: i64,
        reason: String,
        experience_points: i64,
        timestamp: DateTime<Utc>,
    },

    /// A point award moved the user to a higher level
    LevelUp {
        user_id: String,
        old_level: i64,
        new_level: i64,
        timestamp: DateTime<Utc>,
    },

    /// Streak counters changed after recorded activity
    StreakUpdated {
        user_id: String,
        change: StreakChange,
        current_streak: i64,
        longest_streak: i64,
        timestamp: DateTime<Utc>,
    },

    /// Course percent-complete was recomputed
    EnrollmentUpdated {
        user_id: String,
        course_id: String,
        progress_percentage: i64,
        completed: bool,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            ProgressEvent::ModuleCompleted { .. } => "ModuleCompleted",
            ProgressEvent::ModuleUncompleted { .. } => "ModuleUncompleted",
            ProgressEvent::ToggleFailed { .. } => "ToggleFailed",
            ProgressEvent::PointsAwarded { .. } => "PointsAwarded",
            ProgressEvent::LevelUp { .. } => "LevelUp",
            ProgressEvent::StreakUpdated { .. } => "StreakUpdated",
            ProgressEvent::EnrollmentUpdated { .. } => "EnrollmentUpdated",
        }
    }

    /// User the event concerns
    pub fn user_id(&self) -> &str {
        match self {
            ProgressEvent::ModuleCompleted { user_id, .. }
            | ProgressEvent::ModuleUncompleted { user_id, .. }
            | ProgressEvent::ToggleFailed { user_id, .. }
            | ProgressEvent::PointsAwarded { user_id, .. }
            | ProgressEvent::LevelUp { user_id, .. }
            | ProgressEvent::StreakUpdated { user_id, .. }
            | ProgressEvent::EnrollmentUpdated { user_id, .. } => user_id,
        }
    }
}

/// Broadcast bus for progress events
///
/// Cloning the bus yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ProgressEvent,
    ) -> Result<usize, broadcast::error::SendError<ProgressEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
