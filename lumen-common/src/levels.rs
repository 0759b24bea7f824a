//! Level curve and derived progress math
//!
//! The level curve maps cumulative experience points to a level and the
//! remaining points needed for the next one. It is injected into the stats
//! aggregator as `Arc<dyn LevelCurve>` so the policy can change without
//! touching aggregation code.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Level and distance to the next level for a given point total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelProgress {
    pub level: i64,
    /// Always > 0 below the maximum level, exactly 0 at it
    pub points_to_next_level: i64,
}

/// Strategy mapping cumulative experience points to a level
///
/// Implementations must be deterministic and monotonic: for `p1 < p2`,
/// `progress(p1).level <= progress(p2).level`.
pub trait LevelCurve: Send + Sync {
    fn progress(&self, experience_points: i64) -> LevelProgress;

    /// Highest reachable level
    fn max_level(&self) -> i64;
}

/// Level curve where each level costs a fixed step more than the previous one
///
/// Level 1 starts at 0 XP. Advancing from level `n` to `n + 1` costs
/// `base_points + (n - 1) * step_increase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteppedLevelCurve {
    base_points: i64,
    step_increase: i64,
    max_level: i64,
}

impl SteppedLevelCurve {
    pub const DEFAULT_BASE_POINTS: i64 = 100;
    pub const DEFAULT_STEP_INCREASE: i64 = 50;
    pub const DEFAULT_MAX_LEVEL: i64 = 50;

    pub fn new(base_points: i64, step_increase: i64, max_level: i64) -> Result<Self> {
        if base_points <= 0 {
            return Err(Error::Config(format!(
                "level base_points must be positive, got {}",
                base_points
            )));
        }
        if step_increase < 0 {
            return Err(Error::Config(format!(
                "level step_increase must not be negative, got {}",
                step_increase
            )));
        }
        if !(1..=10_000).contains(&max_level) {
            return Err(Error::Config(format!(
                "max_level must be between 1 and 10000, got {}",
                max_level
            )));
        }
        let curve = Self {
            base_points,
            step_increase,
            max_level,
        };
        if curve.checked_threshold(max_level).is_none() {
            return Err(Error::Config(format!(
                "level curve {}/{} overflows before max_level {}",
                base_points, step_increase, max_level
            )));
        }
        Ok(curve)
    }

    /// Cumulative experience required to reach `level`, saturating at
    /// `i64::MAX`
    pub fn threshold(&self, level: i64) -> i64 {
        self.checked_threshold(level).unwrap_or(i64::MAX)
    }

    fn checked_threshold(&self, level: i64) -> Option<i64> {
        if level <= 1 {
            return Some(0);
        }
        let steps = level - 1;
        let base = steps.checked_mul(self.base_points)?;
        // steps * (steps - 1) is always even
        let ramp = steps
            .checked_mul(steps - 1)?
            .checked_div(2)?
            .checked_mul(self.step_increase)?;
        base.checked_add(ramp)
    }
}

impl Default for SteppedLevelCurve {
    fn default() -> Self {
        Self {
            base_points: Self::DEFAULT_BASE_POINTS,
            step_increase: Self::DEFAULT_STEP_INCREASE,
            max_level: Self::DEFAULT_MAX_LEVEL,
        }
    }
}

impl LevelCurve for SteppedLevelCurve {
    fn progress(&self, experience_points: i64) -> LevelProgress {
        let xp = experience_points.max(0);
        let mut level = 1;
        while level < self.max_level && self.threshold(level + 1) <= xp {
            level += 1;
        }

        let points_to_next_level = if level == self.max_level {
            0
        } else {
            self.threshold(level + 1) - xp
        };

        LevelProgress {
            level,
            points_to_next_level,
        }
    }

    fn max_level(&self) -> i64 {
        self.max_level
    }
}

/// Percentage of a course completed, rounded half up, in 0..=100
///
/// Returns 0 for an empty course. Counts above `total_modules` are clamped.
pub fn compute_percent_complete(completed_count: usize, total_modules: usize) -> u8 {
    if total_modules == 0 {
        return 0;
    }
    let completed = completed_count.min(total_modules) as u64;
    let total = total_modules as u64;
    ((completed * 100 + total / 2) / total) as u8
}
