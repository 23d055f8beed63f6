// Re-export dependencies used in public interfaces of common types

use std::fmt;
use std::time::Duration;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

mod state;
mod types;

pub use state::{first_illegal_step, InstanceState};
pub use types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointErrorKind {
    Timeout,
    Busy,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreErrorKind {
    Timeout,
    Busy,
    NotFound,
    Conflict,
    Corrupt,
}

impl RestoreErrorKind {
    /// Recoverable kinds are retried against the same blob; the rest fail the instance.
    pub const fn is_recoverable(self) -> bool {
        matches!(self, RestoreErrorKind::Timeout | RestoreErrorKind::Busy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureReason {
    QueueFull { depth: usize },
    Timeout { waited: Duration },
}

impl fmt::Display for CheckpointErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointErrorKind::Timeout => f.write_str("timeout"),
            CheckpointErrorKind::Busy => f.write_str("busy"),
            CheckpointErrorKind::Unsupported => f.write_str("unsupported"),
        }
    }
}

impl fmt::Display for RestoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreErrorKind::Timeout => f.write_str("timeout"),
            RestoreErrorKind::Busy => f.write_str("busy"),
            RestoreErrorKind::NotFound => f.write_str("not_found"),
            RestoreErrorKind::Conflict => f.write_str("conflict"),
            RestoreErrorKind::Corrupt => f.write_str("corrupt"),
        }
    }
}

impl fmt::Display for BackpressureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackpressureReason::QueueFull { depth } => write!(f, "queue full ({depth} buffered)"),
            BackpressureReason::Timeout { waited } => write!(f, "timed out after {waited:?}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("Prerequisite unavailable: {0}")]
    Prerequisite(String),

    #[error("Checkpoint of {instance} failed ({kind}): {message}")]
    Checkpoint {
        instance: InstanceId,
        kind: CheckpointErrorKind,
        message: String,
    },

    #[error("Restore of {instance} failed ({kind}): {message}")]
    Restore {
        instance: InstanceId,
        kind: RestoreErrorKind,
        message: String,
    },

    #[error("Storage capacity exceeded: {requested} bytes requested, {available} available")]
    StorageCapacity { requested: u64, available: u64 },

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Backpressure on {instance}: {reason}")]
    Backpressure {
        instance: InstanceId,
        reason: BackpressureReason,
    },

    #[error("Invalid transition for {instance}: {from} -> {to}")]
    InvalidTransition {
        instance: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("Unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("Instance {0} has failed and must be re-provisioned")]
    InstanceFailed(InstanceId),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(err.to_string())
    }
}

impl SnapshotError {
    pub fn checkpoint(
        instance: &InstanceId,
        kind: CheckpointErrorKind,
        message: impl Into<String>,
    ) -> Self {
        SnapshotError::Checkpoint {
            instance: instance.clone(),
            kind,
            message: message.into(),
        }
    }

    pub fn restore(instance: &InstanceId, kind: RestoreErrorKind, message: impl Into<String>) -> Self {
        SnapshotError::Restore {
            instance: instance.clone(),
            kind,
            message: message.into(),
        }
    }

    /// Stable label used as the `error_kind` field of structured log events.
    pub fn kind(&self) -> &'static str {
        match self {
            SnapshotError::Prerequisite(_) => "prerequisite",
            SnapshotError::Checkpoint { kind, .. } => match kind {
                CheckpointErrorKind::Timeout => "checkpoint_timeout",
                CheckpointErrorKind::Busy => "checkpoint_busy",
                CheckpointErrorKind::Unsupported => "checkpoint_unsupported",
            },
            SnapshotError::Restore { kind, .. } => match kind {
                RestoreErrorKind::Timeout => "restore_timeout",
                RestoreErrorKind::Busy => "restore_busy",
                RestoreErrorKind::NotFound => "restore_not_found",
                RestoreErrorKind::Conflict => "restore_conflict",
                RestoreErrorKind::Corrupt => "restore_corrupt",
            },
            SnapshotError::StorageCapacity { .. } => "storage_capacity",
            SnapshotError::BlobNotFound(_) => "blob_not_found",
            SnapshotError::Backpressure { .. } => "backpressure",
            SnapshotError::InvalidTransition { .. } => "invalid_transition",
            SnapshotError::UnknownInstance(_) => "unknown_instance",
            SnapshotError::InstanceFailed(_) => "instance_failed",
            SnapshotError::Config(_) => "config",
            SnapshotError::Io(_) => "io",
            SnapshotError::Internal(_) => "internal",
        }
    }

    /// Whether a caller may re-submit the same work later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SnapshotError::Checkpoint { .. }
            | SnapshotError::StorageCapacity { .. }
            | SnapshotError::Backpressure { .. }
            | SnapshotError::Restore { .. } => true,
            SnapshotError::Prerequisite(_)
            | SnapshotError::BlobNotFound(_)
            | SnapshotError::InvalidTransition { .. }
            | SnapshotError::UnknownInstance(_)
            | SnapshotError::InstanceFailed(_)
            | SnapshotError::Config(_)
            | SnapshotError::Io(_)
            | SnapshotError::Internal(_) => false,
        }
    }

    /// Process exit code for the operational CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            SnapshotError::Prerequisite(_) | SnapshotError::Config(_) => 1,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SnapshotError::Prerequisite("criu missing".into()).exit_code(), 1);
        let err = SnapshotError::checkpoint(
            &InstanceId::new("web-1"),
            CheckpointErrorKind::Timeout,
            "took too long",
        );
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.kind(), "checkpoint_timeout");
    }

    #[test]
    fn test_restore_kind_recoverability() {
        assert!(RestoreErrorKind::Timeout.is_recoverable());
        assert!(RestoreErrorKind::Busy.is_recoverable());
        assert!(!RestoreErrorKind::Corrupt.is_recoverable());
        assert!(!RestoreErrorKind::NotFound.is_recoverable());
        assert!(!RestoreErrorKind::Conflict.is_recoverable());
    }

    #[test]
    fn test_serialization() {
        let blob = BlobRef::new(StorageTier::Memory, "web-1/3");
        let json = serde_json::to_string(&blob).unwrap();
        assert!(json.contains("memory"));
        assert_eq!(blob.to_string(), "memory://web-1/3");

        let req = InboundRequest::new("web-1", vec![1, 2, 3]);
        let json_req = serde_json::to_string(&req).unwrap();
        assert!(json_req.contains("web-1"));
    }
}
