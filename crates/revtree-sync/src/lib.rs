//! # revtree sync
//!
//! Anti-entropy replication of document collections using revision trees.
//!
//! ## Overview
//!
//! A source summarises a snapshot of a collection as a [`RevisionTree`]. A
//! follower builds the same tree over its own snapshot, aligned to the
//! source's geometry, and compares the two node by node. Only the leaf ranges
//! whose summaries differ are resolved into revisions and transferred.
//!
//! ## Key Properties
//!
//! - **Snapshot-scoped**: every read goes through an explicit lease
//! - **Resumable**: range resolution pages with plain cursor values
//! - **Bandwidth-efficient**: agreeing subtrees are never expanded
//! - **Transport-agnostic**: the same [`RevisionSource`] trait serves local
//!   stores and remote peers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use revtree_store::{MemoryStore, Store};
//! use revtree_sync::{LocalSource, RevisionSource, SyncConfig, SyncSession};
//!
//! async fn example(leader: Arc<MemoryStore>, follower: Arc<MemoryStore>) -> revtree_sync::Result<()> {
//!     let source = LocalSource::new(leader);
//!     let remote = source.open_snapshot("users", Duration::from_secs(60)).await?;
//!     let local = follower.create_snapshot("users", Duration::from_secs(60)).await?;
//!
//!     let session = SyncSession::new(follower.clone(), &source, SyncConfig::default());
//!     let report = session.run(&local, &remote).await?;
//!     println!("applied {} documents", report.applied);
//!
//!     follower.delete_snapshot(&local).await?;
//!     source.close_snapshot(&remote).await
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Follower                            Source
//!   |-------- OpenSnapshot ----------->|
//!   |<------- Snapshot ----------------|
//!   |-------- RevisionTree ----------->|
//!   |<------- Tree --------------------|
//!   |   (diff against local tree)      |
//!   |-------- Ranges (resume) -------->|
//!   |<------- Ranges (next resume) ----|   repeated until terminal
//!   |-------- Documents -------------->|
//!   |<------- Documents ---------------|   one per fetch batch
//!   |-------- CloseSnapshot ---------->|
//!   |<------- Closed ------------------|
//! ```

pub mod build;
pub mod error;
pub mod fetcher;
pub mod messages;
pub mod protocol;
pub mod resolver;
pub mod source;
pub mod transport;

pub use build::{build_aligned_tree, build_tree};
pub use error::{ErrorKind, Result, SyncError};
pub use fetcher::DocumentFetcher;
pub use messages::{
    decode, encode, limits, DocumentRequest, DocumentResponse, ErrorFrame, RangeQuery,
    RangeResponse, ReplicationRequest, ReplicationResponse, RevisionPage, PROTOCOL_VERSION,
};
pub use protocol::{local_tree, sorted_difference, SyncConfig, SyncPlan, SyncReport, SyncSession};
pub use resolver::RangeResolver;
pub use source::{LocalSource, RevisionSource, DEFAULT_PAGE_SIZE};
pub use transport::{memory::MemoryTransport, serve_request, RemoteSource, Transport};

pub use revtree_core::RevisionTree;
pub use tokio_util::sync::CancellationToken;
