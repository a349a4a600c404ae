//! Error types for tether-core

use thiserror::Error;

use crate::models::EntityType;

/// Result type alias using tether-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity or bookkeeping row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Insert of an id that already exists locally
    #[error("Duplicate {entity_type} entity: {id}")]
    DuplicateEntity { entity_type: EntityType, id: String },

    /// Network failure that is expected to go away on retry
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Remote call exceeded the per-call timeout
    #[error("Remote call timed out after {0} ms")]
    Timeout(u64),

    /// The remote rejected the mutation; retrying will not help
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Any other remote API failure
    #[error("Remote API error: {0}")]
    Remote(String),

    /// A conflict strategy failed; the conflict stays unresolved
    #[error("Conflict resolution failed: {0}")]
    ConflictResolution(String),

    /// A sync cycle is already running on this orchestrator
    #[error("Sync already in progress")]
    SyncAlreadyInProgress,
}

impl Error {
    /// Whether a queue item failing with this error should be retried later.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::Timeout(_) | Self::Remote(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_retryable() {
        assert!(Error::TransientNetwork("connection reset".into()).is_retryable());
        assert!(Error::Timeout(10_000).is_retryable());
        assert!(!Error::ConstraintViolation("parent missing".into()).is_retryable());
        assert!(!Error::SyncAlreadyInProgress.is_retryable());
    }

    #[test]
    fn duplicate_entity_names_type_and_id() {
        let error = Error::DuplicateEntity {
            entity_type: EntityType::Task,
            id: "t-1".to_string(),
        };
        assert_eq!(error.to_string(), "Duplicate task entity: t-1");
    }
}
