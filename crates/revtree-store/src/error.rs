//! Error types for the store module.

use revtree_core::{CoreError, SnapshotId};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Document body serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("document {key:?} not found in {collection}")]
    DocumentNotFound { collection: String, key: String },

    #[error("document {key:?} already exists in {collection}")]
    DocumentExists { collection: String, key: String },

    /// The lease was deleted, never existed, or belongs to another collection.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    /// The lease outlived its TTL.
    #[error("snapshot expired: {0}")]
    SnapshotExpired(SnapshotId),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// A lock was poisoned by a panicking writer.
    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),

    /// A blocking task failed to complete.
    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
