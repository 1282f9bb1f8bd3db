//! Store adapter errors

use crate::clock::Timestamp;

/// Errors that can occur in a store adapter
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict: an event row already exists at this
    /// (aggregate, sequence) position
    #[error("Sequence conflict for aggregate {aggregate_id} at sequence {sequence}")]
    Conflict {
        aggregate_id: Timestamp,
        sequence: u64,
    },

    /// A projection rejected the commit
    #[error("Projection failed: {0}")]
    Projection(String),

    /// The backing store cannot be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Check if this error is a sequence conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Check if retrying the operation may help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::Unavailable(_) | StoreError::Database(_)
        )
    }
}
