//! Error types for the settlement engine
//!
//! Every transition function reports failures through [`SettlementError`].
//! Conflicts are retried internally before they surface; notifier failures
//! are logged and never returned from a transition.

use thiserror::Error;

/// Main error type for settlement operations
#[derive(Error, Debug)]
pub enum SettlementError {
    /// Unknown engagement or payment id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller does not match the recorded party for the requested role
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Transition attempted from a terminal or non-matching state
    #[error("Already terminal: {state}: {reason}")]
    AlreadyTerminal { state: String, reason: String },

    /// Lost an optimistic update race at the ledger store
    #[error("Store conflict: {0}")]
    StoreConflict(String),

    /// Notice could not be delivered
    #[error("Notify failed: {0}")]
    NotifyFailed(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Persistence failure other than a conflict
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create an already-terminal error
    pub fn already_terminal<S: Into<String>>(state: S, reason: S) -> Self {
        Self::AlreadyTerminal {
            state: state.into(),
            reason: reason.into(),
        }
    }

    /// Create a store conflict error
    pub fn store_conflict<S: Into<String>>(msg: S) -> Self {
        Self::StoreConflict(msg.into())
    }

    /// Create a notify failure
    pub fn notify_failed<S: Into<String>>(msg: S) -> Self {
        Self::NotifyFailed(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreConflict(_))
    }
}

impl From<sqlx::Error> for SettlementError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001" | "40P01")) => {
                Self::StoreConflict(db.message().to_string())
            }
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            _ => Self::Store(error.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for SettlementError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::Store(format!("Migration error: {}", error))
    }
}

impl From<config::ConfigError> for SettlementError {
    fn from(error: config::ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(SettlementError::store_conflict("version moved").is_retryable());
        assert!(!SettlementError::not_found("event").is_retryable());
        assert!(!SettlementError::already_terminal("Cancelled", "cancelled").is_retryable());
    }

    #[test]
    fn test_already_terminal_display() {
        let err = SettlementError::already_terminal("Completed", "both parties confirmed");
        assert_eq!(
            err.to_string(),
            "Already terminal: Completed: both parties confirmed"
        );
    }
}
