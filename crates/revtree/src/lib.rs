//! # revtree
//!
//! Anti-entropy replication for document collections, built on revision
//! trees.
//!
//! ## Overview
//!
//! Every live document carries a unique, totally ordered revision. A
//! revision tree summarises a snapshot of a collection: each leaf holds the
//! combined digest and count of the documents whose revisions fall into its
//! slice of the revision space, and each internal node combines its children.
//! Two replicas compare trees top-down and only exchange the slices that
//! differ.
//!
//! ## Key Concepts
//!
//! - **Revision**: `RevisionId`, a `u64` with a compact portable token form.
//! - **Snapshot**: a time-bounded lease on a consistent read view.
//! - **Geometry**: the range, depth and fanout two trees must share to be
//!   compared.
//! - **Resume cursor**: a plain value that lets range resolution page and
//!   restart.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use revtree::{Replicator, ReplicatorConfig};
//! use revtree::store::{CollectionOptions, MemoryStore, SqliteStore, Store, StoreExt};
//! use revtree::core::Value;
//!
//! async fn example() -> revtree::Result<()> {
//!     let leader = Replicator::new(SqliteStore::open("leader.db")?, ReplicatorConfig::default());
//!     leader
//!         .store()
//!         .create_collection("users", CollectionOptions::default())
//!         .await?;
//!     leader
//!         .store()
//!         .insert_document(
//!             "users",
//!             "ada",
//!             Value::Map(vec![(Value::Text("name".into()), Value::Text("Ada".into()))]),
//!         )
//!         .await?;
//!
//!     let follower = Replicator::new(MemoryStore::new(), ReplicatorConfig::default());
//!     follower
//!         .store()
//!         .create_collection("users", CollectionOptions::default())
//!         .await?;
//!
//!     let report = follower.sync_from(&leader.source(), "users").await?;
//!     println!("applied {} documents", report.applied);
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `revtree::core` - revisions, digests, trees, diffing
//! - `revtree::store` - storage abstraction, snapshot leases, SQLite
//! - `revtree::sync` - sources, resolver, fetcher, sync session, transport

pub mod error;
pub mod replicator;

// Re-export component crates
pub use revtree_core as core;
pub use revtree_store as store;
pub use revtree_sync as sync;

// Re-export main types for convenience
pub use error::{ReplicatorError, Result};
pub use replicator::{Replicator, ReplicatorConfig};

// Re-export commonly used types
pub use revtree_core::{
    coalesce, diff, Digest, Document, ResumeCursor, RevisionId, RevisionNode, RevisionRange,
    RevisionTree, SnapshotHandle, TreeGeometry, TreeOptions,
};
pub use revtree_sync::{
    DocumentFetcher, LocalSource, RangeResolver, RemoteSource, RevisionSource, SyncConfig,
    SyncPlan, SyncReport,
};
