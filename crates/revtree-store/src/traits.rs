//! Store trait: the abstract interface for document persistence and
//! snapshot leases.
//!
//! Implementations include SQLite (primary) and in-memory (for tests).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use revtree_core::{
    body_from_record, Digest, Document, ResumeCursor, RevisionId, RevisionRange, SnapshotHandle,
    Value,
};

use crate::error::Result;

/// Per-collection settings fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Whether the collection takes part in revision-tree replication.
    pub revision_tree: bool,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            revision_tree: true,
        }
    }
}

impl CollectionOptions {
    /// A collection without revision-tree support.
    pub fn legacy() -> Self {
        Self {
            revision_tree: false,
        }
    }
}

/// Live-revision statistics of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotStats {
    pub count: u64,
    pub min_rev: Option<RevisionId>,
    pub max_rev: Option<RevisionId>,
}

impl SnapshotStats {
    /// `(min, max)` of the live revisions, if there are any.
    pub fn bounds(&self) -> Option<(RevisionId, RevisionId)> {
        self.min_rev.zip(self.max_rev)
    }
}

/// The Store trait: async interface for documents and snapshots.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, `spawn_blocking` is used internally to avoid blocking the
/// runtime.
///
/// # Revisions
///
/// Every local write gets a fresh revision from the store's clock, strictly
/// greater than any revision it has issued or applied. Replicated writes go
/// through [`Store::apply_document`] and keep the revision they arrived with.
///
/// # Snapshots
///
/// A snapshot fixes the set of live revisions of one collection at the moment
/// it is created. Later writes are invisible to it. Every `snapshot_*` read
/// fails with `SnapshotExpired` once the lease's TTL has passed, and with
/// `SnapshotNotFound` once it has been deleted.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Collections
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an empty collection.
    async fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<()>;

    /// Settings of an existing collection.
    async fn collection_options(&self, name: &str) -> Result<CollectionOptions>;

    // ─────────────────────────────────────────────────────────────────────────
    // Documents (live view)
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert new documents in one atomic batch, returning their revisions
    /// in input order. Fails if any key is already live.
    async fn insert_documents(
        &self,
        collection: &str,
        documents: &[(String, Value)],
    ) -> Result<Vec<RevisionId>>;

    /// Replace the body of a live document under a fresh revision.
    async fn update_document(&self, collection: &str, key: &str, body: &Value)
        -> Result<RevisionId>;

    /// Delete a live document, returning the revision that stopped being live.
    async fn remove_document(&self, collection: &str, key: &str) -> Result<RevisionId>;

    /// The live document for `key`.
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Document>>;

    /// Apply a replicated document, keeping its revision.
    ///
    /// Any live document with the same key is replaced; its revision is
    /// returned. Applying a revision that is already live is a no-op.
    async fn apply_document(&self, collection: &str, document: &Document)
        -> Result<Option<RevisionId>>;

    /// Delete whatever live document carries `rev`. Returns whether one did.
    async fn remove_revision(&self, collection: &str, rev: RevisionId) -> Result<bool>;

    /// Number of live documents.
    async fn document_count(&self, collection: &str) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Open a consistent read view of `collection` valid for `ttl`.
    async fn create_snapshot(&self, collection: &str, ttl: Duration) -> Result<SnapshotHandle>;

    /// Release a snapshot lease.
    async fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<()>;

    /// Count and bounds of the snapshot's live revisions.
    async fn snapshot_stats(&self, handle: &SnapshotHandle) -> Result<SnapshotStats>;

    /// `(rev, digest)` of every live revision in `range`, ascending.
    async fn snapshot_digests(
        &self,
        handle: &SnapshotHandle,
        range: RevisionRange,
    ) -> Result<Vec<(RevisionId, Digest)>>;

    /// Up to `limit` live revisions in `range` past `after`, ascending.
    async fn snapshot_revisions(
        &self,
        handle: &SnapshotHandle,
        range: RevisionRange,
        after: ResumeCursor,
        limit: usize,
    ) -> Result<Vec<RevisionId>>;

    /// The document for each revision, `None` where the snapshot has none.
    async fn snapshot_documents(
        &self,
        handle: &SnapshotHandle,
        revs: &[RevisionId],
    ) -> Result<Vec<Option<Document>>>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// Insert one document, returning its revision.
    fn insert_document(
        &self,
        collection: &str,
        key: &str,
        body: Value,
    ) -> impl std::future::Future<Output = Result<RevisionId>> + Send;

    /// Insert typed records, serialized through serde.
    fn insert_records<T: Serialize + Sync>(
        &self,
        collection: &str,
        records: &[(String, T)],
    ) -> impl std::future::Future<Output = Result<Vec<RevisionId>>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn insert_document(&self, collection: &str, key: &str, body: Value) -> Result<RevisionId> {
        let mut revs = self
            .insert_documents(collection, &[(key.to_string(), body)])
            .await?;
        revs.pop().ok_or_else(|| {
            crate::error::StoreError::InvalidData("insert returned no revision".into())
        })
    }

    async fn insert_records<T: Serialize + Sync>(
        &self,
        collection: &str,
        records: &[(String, T)],
    ) -> Result<Vec<RevisionId>> {
        let documents = records
            .iter()
            .map(|(key, record)| -> Result<(String, Value)> {
                Ok((key.clone(), body_from_record(record)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.insert_documents(collection, &documents).await
    }
}

/// First revision a paged read may return for `range` and `after`, or
/// `None` when the cursor is already past the range.
pub(crate) fn page_start(range: RevisionRange, after: ResumeCursor) -> Option<RevisionId> {
    match after {
        ResumeCursor::Start => Some(range.min),
        ResumeCursor::After(last) if last >= range.max => None,
        ResumeCursor::After(last) => Some(range.min.max(last.saturating_next())),
    }
}
