//! Commitment tiers
//!
//! A user's chosen time commitment selects which progress partition holds
//! their completion records. The four tiers are structurally identical and
//! differ only by the table they live in.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Learning-intensity tier chosen during onboarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Minimal,
    Moderate,
    Significant,
    Intensive,
}

impl Tier {
    /// All tiers in ascending order of commitment
    pub const ALL: [Tier; 4] = [
        Tier::Minimal,
        Tier::Moderate,
        Tier::Significant,
        Tier::Intensive,
    ];

    /// Tier used whenever the requested one cannot be resolved
    pub const DEFAULT: Tier = Tier::Moderate;

    /// Canonical lowercase name, as stored in profiles and URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Minimal => "minimal",
            Tier::Moderate => "moderate",
            Tier::Significant => "significant",
            Tier::Intensive => "intensive",
        }
    }

    /// Name of the progress table backing this tier
    pub fn table_name(&self) -> &'static str {
        match self {
            Tier::Minimal => "progress_minimal",
            Tier::Moderate => "progress_moderate",
            Tier::Significant => "progress_significant",
            Tier::Intensive => "progress_intensive",
        }
    }

    /// Resolve a raw tier value, falling back to `fallback` on anything unknown
    ///
    /// Missing values fall back silently; unrecognized values are logged.
    pub fn parse_or(raw: Option<&str>, fallback: Tier) -> Tier {
        match raw {
            None => fallback,
            Some(s) => s.parse().unwrap_or_else(|e: Error| {
                warn!("{}, using '{}' tier", e, fallback);
                fallback
            }),
        }
    }

    /// Resolve a raw tier value, falling back to [`Tier::DEFAULT`]
    pub fn parse_or_default(raw: Option<&str>) -> Tier {
        Self::parse_or(raw, Self::DEFAULT)
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::DEFAULT
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "minimal" => Ok(Tier::Minimal),
            "moderate" => Ok(Tier::Moderate),
            "significant" => Ok(Tier::Significant),
            "intensive" => Ok(Tier::Intensive),
            _ => Err(Error::InvalidTier(s.to_string())),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
