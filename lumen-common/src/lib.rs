//! # Lumen Common Library
//!
//! Shared code for all Lumen services including:
//! - Error taxonomy shared by every service
//! - Commitment tiers and the progress data model
//! - Catalog contract types
//! - Level curve, percent-complete and streak arithmetic
//! - Event types and EventBus
//! - Configuration loading and database bootstrap

pub mod catalog;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod levels;
pub mod models;
pub mod streak;
pub mod tier;
pub mod time;

pub use error::{Error, Result};
pub use levels::{LevelCurve, LevelProgress, SteppedLevelCurve};
pub use tier::Tier;
