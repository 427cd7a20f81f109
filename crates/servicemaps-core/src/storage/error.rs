//! Storage error handling
//!
//! Provides typed errors for local cache operations with descriptive
//! messages and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::{EntityKind, RecordKey};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A child row references a parent that is not in the cache
    #[error("Cannot store {kind} '{key}': parent {parent_kind} '{parent}' does not exist")]
    MissingParent {
        kind: EntityKind,
        key: RecordKey,
        parent_kind: EntityKind,
        parent: RecordKey,
    },

    /// Key arity does not match the kind's primary key
    #[error("Invalid key '{key}' for {kind}")]
    InvalidKey { kind: EntityKind, key: String },

    /// A stored payload could not be (de)serialized
    #[error("Invalid payload for {kind}: {source}")]
    Payload {
        kind: EntityKind,
        #[source]
        source: serde_json::Error,
    },

    /// A stored value is not in the expected format
    #[error("Corrupt value in '{table}': {details}")]
    CorruptValue { table: &'static str, details: String },

    /// Another thread panicked while holding the database
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::CreateDirectory {
                path,
                source: error,
            },
        }
    }

    /// Whether this error means the data was rejected rather than the store failing
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            StorageError::MissingParent { .. }
                | StorageError::InvalidKey { .. }
                | StorageError::Payload { .. }
        )
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull { .. }
                | StorageError::PermissionDenied { .. }
                | StorageError::MissingParent { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions. You may need to run with different permissions or change ownership.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StorageError::MissingParent { .. } => {
                Some("Run a full sync so the parent record is downloaded first.")
            }
            StorageError::CorruptValue { .. } => {
                Some("Remove the local database to rebuild it from the server on the next sync.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
