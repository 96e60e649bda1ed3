//! Error types for the sync module.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use revtree_core::{CoreError, RevisionId};
use revtree_store::StoreError;

use crate::messages::ErrorFrame;

/// Errors that can occur during replication.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The collection does not maintain revision trees.
    #[error("revision trees not supported: {0}")]
    NotSupported(String),

    /// The snapshot lease outlived its TTL; re-snapshot and retry.
    #[error("snapshot expired: {0}")]
    SnapshotExpired(String),

    /// The snapshot lease was deleted or never existed.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// A range with `min > max`, or ranges that overlap or are out of order.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Trees that cannot be compared node by node.
    #[error("tree version mismatch: {0}")]
    VersionMismatch(String),

    /// A deadline passed before the peer produced a usable answer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A failure the peer expects to clear on retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A requested revision does not exist in the snapshot.
    #[error("unknown revision: {0}")]
    UnknownRevision(RevisionId),

    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(StoreError),

    /// A background task died.
    #[error("internal error: {0}")]
    Internal(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

/// Coarse classification of [`SyncError`], shared with the wire error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorKind {
    Internal = 0,
    NotSupported = 1,
    SnapshotExpired = 2,
    SnapshotNotFound = 3,
    InvalidRange = 4,
    VersionMismatch = 5,
    Timeout = 6,
    Transient = 7,
    UnknownRevision = 8,
    Protocol = 9,
    Transport = 10,
    Storage = 11,
    Cancelled = 12,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotSupported(_) => ErrorKind::NotSupported,
            SyncError::SnapshotExpired(_) => ErrorKind::SnapshotExpired,
            SyncError::SnapshotNotFound(_) => ErrorKind::SnapshotNotFound,
            SyncError::InvalidRange(_) => ErrorKind::InvalidRange,
            SyncError::VersionMismatch(_) => ErrorKind::VersionMismatch,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::Transient(_) => ErrorKind::Transient,
            SyncError::UnknownRevision(_) => ErrorKind::UnknownRevision,
            SyncError::InvalidMessage(_) => ErrorKind::Protocol,
            SyncError::TransportError(_) => ErrorKind::Transport,
            SyncError::StoreError(_) => ErrorKind::Storage,
            SyncError::Internal(_) => ErrorKind::Internal,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether repeating the operation (possibly on a fresh snapshot) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SnapshotExpired
                | ErrorKind::Transient
                | ErrorKind::Timeout
                | ErrorKind::Transport
        )
    }

    /// Whether the peer lacks revision-tree support, so the caller should fall
    /// back to another replication strategy.
    pub fn is_not_supported(&self) -> bool {
        self.kind() == ErrorKind::NotSupported
    }

    /// Encode for the wire.
    pub fn to_frame(&self) -> ErrorFrame {
        ErrorFrame {
            code: self.kind(),
            message: self.to_string(),
            revision: match self {
                SyncError::UnknownRevision(rev) => Some(*rev),
                _ => None,
            },
        }
    }

    /// Rebuild an error received from a peer.
    pub fn from_frame(frame: ErrorFrame) -> Self {
        let ErrorFrame {
            code,
            message,
            revision,
        } = frame;
        match code {
            ErrorKind::NotSupported => SyncError::NotSupported(message),
            ErrorKind::SnapshotExpired => SyncError::SnapshotExpired(message),
            ErrorKind::SnapshotNotFound => SyncError::SnapshotNotFound(message),
            ErrorKind::InvalidRange => SyncError::InvalidRange(message),
            ErrorKind::VersionMismatch => SyncError::VersionMismatch(message),
            ErrorKind::Timeout => SyncError::Timeout(message),
            ErrorKind::Transient => SyncError::Transient(message),
            ErrorKind::UnknownRevision => match revision {
                Some(rev) => SyncError::UnknownRevision(rev),
                None => SyncError::InvalidMessage(format!("unknown revision without id: {message}")),
            },
            ErrorKind::Protocol => SyncError::InvalidMessage(message),
            ErrorKind::Transport => SyncError::TransportError(message),
            ErrorKind::Storage | ErrorKind::Internal => {
                SyncError::Internal(format!("peer: {message}"))
            }
            ErrorKind::Cancelled => SyncError::Cancelled,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SnapshotNotFound(id) => SyncError::SnapshotNotFound(id.to_string()),
            StoreError::SnapshotExpired(id) => SyncError::SnapshotExpired(id.to_string()),
            StoreError::Core(core) => core.into(),
            other => SyncError::StoreError(other),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidRange { .. }
            | CoreError::UnorderedRanges(_)
            | CoreError::OutOfBounds { .. } => SyncError::InvalidRange(err.to_string()),
            CoreError::VersionMismatch { .. } => SyncError::VersionMismatch(err.to_string()),
            other => SyncError::InvalidMessage(other.to_string()),
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
