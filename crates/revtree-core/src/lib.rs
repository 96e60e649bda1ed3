//! # Revtree Core
//!
//! Pure primitives for revision-tree replication: revisions, digests,
//! documents, and the revision tree itself.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`RevisionId`] - Position of a document version in a collection's history
//! - [`Digest`] - 32-byte digest with an order-independent combiner
//! - [`RevisionTree`] - Dense fixed-fanout summary of a revision range
//! - [`Document`] - Key, revision, and CBOR body
//!
//! ## Comparison
//!
//! Two trees with the same [`TreeGeometry`] are compared with [`diff`], which
//! returns the leaf ranges whose summaries differ.

pub mod builder;
pub mod canonical;
pub mod clock;
pub mod diff;
pub mod digest;
pub mod document;
pub mod error;
pub mod tree;
pub mod types;

pub use builder::{build_aligned, build_tree, LeafBatch, TreeBuilder};
pub use canonical::{canonical_value_bytes, document_digest, document_digest_from_canonical};
pub use clock::RevisionClock;
pub use diff::{coalesce, diff};
pub use digest::{Digest, DIGEST_LEN};
pub use document::{body_from_canonical, body_from_record, Document};
pub use error::{CoreError, Result};
pub use tree::{
    node_count, RevisionNode, RevisionTree, TreeGeometry, TreeOptions, TREE_FORMAT_VERSION,
};
pub use types::{
    validate_ranges, ResumeCursor, RevisionId, RevisionRange, Revisions, SnapshotHandle,
    SnapshotId,
};

/// Re-exported so callers can build document bodies without a direct dependency.
pub use ciborium::value::Value;
