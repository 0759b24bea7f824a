//! Common error types for Lumen

use thiserror::Error;

/// Common result type for Lumen operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across Lumen services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested course, module or user row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Commitment tier string outside the four known tiers
    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient progress store failure (check/insert/delete)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// More than one completion row exists for the same module
    #[error("Reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    /// Operation abandoned because its session was closed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may recover by retrying or falling back
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidTier(_) | Error::StoreUnavailable(_) | Error::ReconciliationConflict(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_detail() {
        let err = Error::InvalidTier("ultra".to_string());
        assert_eq!(err.to_string(), "Invalid tier: ultra");

        let err = Error::NotFound("course 'nope'".to_string());
        assert_eq!(err.to_string(), "Not found: course 'nope'");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::StoreUnavailable("timeout".into()).is_recoverable());
        assert!(Error::InvalidTier("x".into()).is_recoverable());
        assert!(!Error::NotFound("x".into()).is_recoverable());
        assert!(!Error::Cancelled("x".into()).is_recoverable());
    }
}
