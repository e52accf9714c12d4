//! Error types for Tessera
//!
//! Provides a unified error type for assignment and rebalance operations.

use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Unified error type for Tessera
#[derive(Error, Debug)]
pub enum TesseraError {
    // ===== Configuration Errors =====
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    // ===== Assignment Errors =====
    #[error("No enabled instances with tag: {tag}")]
    EmptyInstancePool { tag: String },

    #[error("Insufficient instances for {context}: have {available}, need {required}")]
    InsufficientInstances {
        context: String,
        available: usize,
        required: usize,
    },

    #[error("Invalid instance partitions: {0}")]
    InvalidInstancePartitions(String),

    // ===== Cluster State Errors =====
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Concurrent modification of {resource}: gave up after {attempts} attempts")]
    ConcurrentModification { resource: String, attempts: u32 },

    #[error("Cluster state error: {0}")]
    Cluster(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TesseraError {
    /// Errors raised while computing assignments, before anything is written
    pub fn is_assignment_error(&self) -> bool {
        matches!(
            self,
            TesseraError::EmptyInstancePool { .. }
                | TesseraError::InsufficientInstances { .. }
                | TesseraError::InvalidInstancePartitions(_)
        )
    }

    /// Wrap a collaborator error
    pub fn cluster(err: impl std::fmt::Display) -> Self {
        TesseraError::Cluster(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = TesseraError::InsufficientInstances {
            context: "replica group 1".to_string(),
            available: 2,
            required: 3,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient instances for replica group 1: have 2, need 3"
        );
        assert!(err.is_assignment_error());
        assert!(!TesseraError::TableNotFound("t".into()).is_assignment_error());
    }
}
