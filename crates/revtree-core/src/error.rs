//! Error types for revtree core.

use thiserror::Error;

use crate::tree::TreeGeometry;
use crate::types::RevisionId;

/// Errors raised by the pure revision-tree primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A range with `min > max`.
    #[error("invalid range: min {min} > max {max}")]
    InvalidRange { min: RevisionId, max: RevisionId },

    /// A revision outside the bounds a tree covers.
    #[error("revision {rev} outside tree bounds [{min}, {max})")]
    OutOfBounds {
        rev: RevisionId,
        min: RevisionId,
        max: RevisionId,
    },

    /// Ranges that are not ascending and disjoint.
    #[error("ranges overlap or are out of order at index {0}")]
    UnorderedRanges(usize),

    /// Two trees cannot be compared structurally.
    #[error("tree geometry mismatch: local={local:?}, remote={remote:?}")]
    VersionMismatch {
        local: TreeGeometry,
        remote: TreeGeometry,
    },

    /// Tree options or a decoded tree violate a structural rule.
    #[error("malformed tree: {0}")]
    MalformedTree(String),

    /// A revision token that does not decode.
    #[error("invalid revision token: {0:?}")]
    InvalidToken(String),

    /// The clock has issued `RevisionId::LAST`.
    #[error("revision clock exhausted after {0}")]
    ClockExhausted(RevisionId),

    /// Document body is not a map or cannot be converted.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
