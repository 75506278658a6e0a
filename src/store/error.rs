//! Error types for the durable store.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration { message: String },

    /// Requested entity was not found (or is soft-deleted).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Input failed validation before any write happened.
    #[error("validation error: {0}")]
    Validation(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether retrying the failed operation can succeed.
    ///
    /// Database and pool failures abort their transaction cleanly, so the
    /// caller may retry. Validation and not-found failures never will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(_) | StoreError::Pool(_) | StoreError::Migration { .. }
        )
    }
}

/// Convenience type alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = StoreError::not_found("conversation", "conv_123");
        assert_eq!(err.to_string(), "conversation not found: conv_123");
        assert!(!err.is_retryable());
    }

    #[test]
    fn sqlite_errors_are_retryable() {
        let err = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = StoreError::validation("agent_id must not be empty");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("agent_id"));
    }
}
