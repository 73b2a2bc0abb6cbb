//! Store error types.

use iotdm_protocol::GatewayError;
use thiserror::Error;

/// Errors from resource tree operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("resource not found: {resource_id}")]
    NotFound { resource_id: String },

    #[error("resource name '{name}' already exists under {parent_id}")]
    NameExists { parent_id: String, name: String },

    #[error("revision conflict on {resource_id}: expected {expected}, actual {actual}")]
    RevisionConflict {
        resource_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("parent {parent_id} was deleted")]
    ParentDeleted { parent_id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(resource_id: impl Into<String>) -> Self {
        StoreError::NotFound {
            resource_id: resource_id.into(),
        }
    }

    /// Returns whether this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Returns whether the failure is a concurrent-modification conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::NameExists { .. }
                | StoreError::RevisionConflict { .. }
                | StoreError::ParentDeleted { .. }
        )
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => GatewayError::NotFound(err.to_string()),
            StoreError::NameExists { .. }
            | StoreError::RevisionConflict { .. }
            | StoreError::ParentDeleted { .. } => GatewayError::Conflict(err.to_string()),
            StoreError::Unavailable(_) => GatewayError::StoreUnavailable(err.to_string()),
        }
    }
}
