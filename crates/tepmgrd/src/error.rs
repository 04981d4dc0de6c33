//! Error types for tunnel endpoint management.
//!
//! Validation and duplicate-endpoint errors are raised before any store
//! mutation. Individual wiring failures never surface here; they are
//! collected in the pass report instead.

use std::io;
use std::net::IpAddr;

use sonic_orch_common::TaskError;
use thiserror::Error;

use crate::id_alloc::IdAllocError;
use crate::mesh::MeshError;
use crate::store::StoreError;
use crate::types::NodeId;

/// Result type alias for tepmgrd operations.
pub type TepMgrResult<T> = Result<T, TepMgrError>;

#[derive(Debug, Error)]
pub enum TepMgrError {
    /// Malformed address, subnet or VLAN, or a per-zone endpoint policy
    /// violation.
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Endpoint repeated within a request or already owned by another node.
    #[error("Duplicate endpoint {ip} for node {node_id}: {message}")]
    DuplicateEndpoint {
        node_id: NodeId,
        ip: IpAddr,
        message: String,
    },

    /// Commit or read against the backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    IdAllocation(#[from] IdAllocError),

    #[error("Invalid configuration for {field}: {message}")]
    Config { field: String, message: String },

    /// The worker running a pass went away before reporting.
    #[error("Pass queued under '{key}' was cancelled before completion")]
    JobCancelled { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TepMgrError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn duplicate(node_id: NodeId, ip: IpAddr, message: impl Into<String>) -> Self {
        Self::DuplicateEndpoint {
            node_id,
            ip,
            message: message.into(),
        }
    }

    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if the failed request may succeed when submitted again
    /// unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::IdAllocation(IdAllocError::Store(e)) => e.is_retryable(),
            Self::JobCancelled { .. } => true,
            _ => false,
        }
    }

    /// Returns true if another pass changed what this pass read before it
    /// could commit.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Store(e) => e.is_conflict(),
            Self::IdAllocation(IdAllocError::Store(e)) => e.is_conflict(),
            _ => false,
        }
    }

    /// Returns true for errors raised before any mutation was staged.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::DuplicateEndpoint { .. }
        )
    }
}

impl From<MeshError> for TepMgrError {
    fn from(err: MeshError) -> Self {
        Self::validation("zone", err.to_string())
    }
}

impl From<TepMgrError> for TaskError {
    fn from(err: TepMgrError) -> Self {
        if err.is_rejection() {
            TaskError::invalid_entry(err.to_string())
        } else if err.is_retryable() {
            TaskError::need_retry(err.to_string())
        } else if let TepMgrError::Store(_) = err {
            TaskError::store(err.to_string())
        } else {
            TaskError::internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_orch_common::TaskStatus;

    #[test]
    fn test_error_display() {
        let err = TepMgrError::validation("subnet", "10.0.1.1 is outside 10.0.0.0/24");
        assert_eq!(
            err.to_string(),
            "Invalid subnet: 10.0.1.1 is outside 10.0.0.0/24"
        );

        let err = TepMgrError::duplicate(2, "10.0.0.1".parse().unwrap(), "owned by node 1");
        assert!(err.to_string().contains("10.0.0.1"));
        assert!(err.to_string().contains("node 2"));
    }

    #[test]
    fn test_task_status_mapping() {
        let rejected: TaskError = TepMgrError::validation("zone", "empty").into();
        assert_eq!(rejected.to_status(), TaskStatus::InvalidEntry);

        let busy: TaskError = TepMgrError::Store(StoreError::unavailable("connection reset")).into();
        assert_eq!(busy.to_status(), TaskStatus::NeedRetry);

        let failed: TaskError = TepMgrError::Store(StoreError::commit_failed("rejected")).into();
        assert_eq!(failed.to_status(), TaskStatus::Failed);

        let raced = TepMgrError::Store(StoreError::conflict("DPN_ENDPOINTS|1 changed"));
        assert!(raced.is_conflict());
        let raced: TaskError = raced.into();
        assert_eq!(raced.to_status(), TaskStatus::NeedRetry);

        let cancelled: TaskError = TepMgrError::JobCancelled {
            key: "Z1".to_string(),
        }
        .into();
        assert_eq!(cancelled.to_status(), TaskStatus::NeedRetry);
    }
}
