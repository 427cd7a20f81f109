//! Errors surfaced by synchronization

use thiserror::Error;
use tokio::task::JoinError;

use crate::models::{EntityKind, RecordKey};
use crate::realtime::RealtimeError;
use crate::remote::RemoteError;
use crate::storage::StorageError;

/// Errors from a sync pass, an upload or the realtime channel
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure or server outage; the operation can be retried
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server refused a queued change
    #[error("Server rejected {kind} '{target}': {message}")]
    ServerRejected {
        kind: EntityKind,
        target: RecordKey,
        message: String,
    },

    /// The session is no longer accepted by the server
    #[error("Not authorized")]
    Unauthorized,

    /// A snapshot could not be applied to the local cache
    #[error("Could not reconcile {kind}: {reason}")]
    Reconciliation { kind: EntityKind, reason: String },

    #[error("Realtime channel error: {0}")]
    RealtimeChannel(#[from] RealtimeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The user signed out while the pass was running; nothing was applied
    #[error("Sync cancelled by sign-out")]
    Cancelled,

    #[error("Sync task failed: {0}")]
    Task(#[from] JoinError),
}

impl SyncError {
    /// Whether running the same operation again later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::RealtimeChannel(_) => true,
            SyncError::Storage(e) => e.is_recoverable(),
            SyncError::ServerRejected { .. }
            | SyncError::Unauthorized
            | SyncError::Reconciliation { .. }
            | SyncError::Cancelled
            | SyncError::Task(_) => false,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized => SyncError::Unauthorized,
            other => SyncError::Transport(other.to_string()),
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_is_retryable() {
        assert!(SyncError::Transport("timed out".into()).is_retryable());
        assert!(!SyncError::Unauthorized.is_retryable());
    }

    #[test]
    fn test_from_remote_error() {
        let err: SyncError = RemoteError::Unauthorized.into();
        assert!(matches!(err, SyncError::Unauthorized));

        let err: SyncError = RemoteError::Transport("connection reset".into()).into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_rejection_message() {
        let err = SyncError::ServerRejected {
            kind: EntityKind::Visit,
            target: RecordKey::id("h1-5"),
            message: "house is locked".into(),
        };
        assert_eq!(
            err.to_string(),
            "Server rejected visit 'h1-5': house is locked"
        );
    }
}
