//! Error types for the replicator.

use revtree_core::CoreError;
use revtree_store::StoreError;
use revtree_sync::{ErrorKind, SyncError};
use thiserror::Error;

/// Errors that can occur during replicator operations.
#[derive(Debug, Error)]
pub enum ReplicatorError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Tree or revision error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl ReplicatorError {
    /// Whether the failure is the peer or collection lacking revision-tree
    /// support. Callers fall back to another replication strategy.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, ReplicatorError::Sync(e) if e.is_not_supported())
    }

    /// Whether running the operation again, on a fresh snapshot, can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicatorError::Sync(e) => e.is_retryable(),
            ReplicatorError::Store(StoreError::SnapshotExpired(_)) => true,
            _ => false,
        }
    }

    /// The sync error kind, where there is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ReplicatorError::Sync(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Result type for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicatorError>;
