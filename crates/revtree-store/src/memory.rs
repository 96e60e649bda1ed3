//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.
//!
//! Each collection keeps its live documents in an `Arc<BTreeMap>` keyed by
//! revision. A snapshot clones the `Arc`; the next write copies the map
//! (`Arc::make_mut`) so the snapshot keeps seeing the old contents.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;

use revtree_core::{
    Digest, Document, ResumeCursor, RevisionClock, RevisionId, RevisionRange, SnapshotHandle,
    Value,
};

use crate::error::{Result, StoreError};
use crate::lease::LeaseTable;
use crate::traits::{page_start, CollectionOptions, SnapshotStats, Store};

type RevisionMap = BTreeMap<RevisionId, StoredDocument>;

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
    clock: RevisionClock,
}

#[derive(Default)]
struct MemoryStoreInner {
    collections: HashMap<String, Collection>,
    snapshots: LeaseTable<SnapshotView>,
}

struct Collection {
    options: CollectionOptions,
    /// Live documents by revision.
    by_rev: Arc<RevisionMap>,
    /// Live revision of each key.
    by_key: HashMap<String, RevisionId>,
}

#[derive(Clone)]
struct StoredDocument {
    document: Arc<Document>,
    digest: Digest,
}

struct SnapshotView {
    collection: String,
    documents: Arc<RevisionMap>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
            clock: RevisionClock::new(),
        }
    }

    /// Snapshot leases not yet deleted, lapsed ones included.
    pub fn snapshot_count(&self) -> Result<usize> {
        Ok(self.read()?.snapshots.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }

    fn view(&self, handle: &SnapshotHandle) -> Result<&RevisionMap> {
        let view = self.snapshots.get(handle.id)?;
        if view.collection != handle.collection {
            return Err(StoreError::SnapshotNotFound(handle.id));
        }
        Ok(&view.documents)
    }
}

impl Collection {
    fn put(&mut self, stored: StoredDocument) {
        let rev = stored.document.rev;
        self.by_key.insert(stored.document.key.clone(), rev);
        Arc::make_mut(&mut self.by_rev).insert(rev, stored);
    }

    fn take(&mut self, rev: RevisionId) -> Option<StoredDocument> {
        let stored = Arc::make_mut(&mut self.by_rev).remove(&rev)?;
        if self.by_key.get(&stored.document.key) == Some(&rev) {
            self.by_key.remove(&stored.document.key);
        }
        Some(stored)
    }
}

fn stored(document: Document) -> Result<StoredDocument> {
    let digest = document.digest()?;
    Ok(StoredDocument {
        document: Arc::new(document),
        digest,
    })
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<()> {
        let mut inner = self.write()?;
        if inner.collections.contains_key(name) {
            return Err(StoreError::CollectionExists(name.to_string()));
        }
        inner.collections.insert(
            name.to_string(),
            Collection {
                options,
                by_rev: Arc::new(BTreeMap::new()),
                by_key: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn collection_options(&self, name: &str) -> Result<CollectionOptions> {
        Ok(self.read()?.collection(name)?.options)
    }

    async fn insert_documents(
        &self,
        collection: &str,
        documents: &[(String, Value)],
    ) -> Result<Vec<RevisionId>> {
        let mut inner = self.write()?;
        let coll = inner.collection_mut(collection)?;

        // validate the whole batch before touching anything
        let mut seen = std::collections::HashSet::new();
        for (key, _) in documents {
            if coll.by_key.contains_key(key) || !seen.insert(key.as_str()) {
                return Err(StoreError::DocumentExists {
                    collection: collection.to_string(),
                    key: key.clone(),
                });
            }
        }
        let mut prepared = Vec::with_capacity(documents.len());
        for (key, body) in documents {
            prepared.push(stored(Document::new(key.clone(), self.clock.next()?, body.clone())?)?);
        }

        let mut revs = Vec::with_capacity(prepared.len());
        for doc in prepared {
            revs.push(doc.document.rev);
            coll.put(doc);
        }
        Ok(revs)
    }

    async fn update_document(
        &self,
        collection: &str,
        key: &str,
        body: &Value,
    ) -> Result<RevisionId> {
        let mut inner = self.write()?;
        let coll = inner.collection_mut(collection)?;
        let old = *coll
            .by_key
            .get(key)
            .ok_or_else(|| StoreError::DocumentNotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            })?;
        let doc = stored(Document::new(key, self.clock.next()?, body.clone())?)?;
        let rev = doc.document.rev;
        coll.take(old);
        coll.put(doc);
        Ok(rev)
    }

    async fn remove_document(&self, collection: &str, key: &str) -> Result<RevisionId> {
        let mut inner = self.write()?;
        let coll = inner.collection_mut(collection)?;
        let rev = *coll
            .by_key
            .get(key)
            .ok_or_else(|| StoreError::DocumentNotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            })?;
        coll.take(rev);
        Ok(rev)
    }

    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Document>> {
        let inner = self.read()?;
        let coll = inner.collection(collection)?;
        Ok(coll
            .by_key
            .get(key)
            .and_then(|rev| coll.by_rev.get(rev))
            .map(|s| s.document.as_ref().clone()))
    }

    async fn apply_document(
        &self,
        collection: &str,
        document: &Document,
    ) -> Result<Option<RevisionId>> {
        document.validate()?;
        let doc = stored(document.clone())?;
        let mut inner = self.write()?;
        let coll = inner.collection_mut(collection)?;
        if coll.by_rev.contains_key(&document.rev) {
            return Ok(None);
        }
        let replaced = coll.by_key.get(&document.key).copied();
        if let Some(old) = replaced {
            coll.take(old);
        }
        coll.put(doc);
        self.clock.observe(document.rev);
        Ok(replaced)
    }

    async fn remove_revision(&self, collection: &str, rev: RevisionId) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(inner.collection_mut(collection)?.take(rev).is_some())
    }

    async fn document_count(&self, collection: &str) -> Result<u64> {
        Ok(self.read()?.collection(collection)?.by_rev.len() as u64)
    }

    async fn create_snapshot(&self, collection: &str, ttl: Duration) -> Result<SnapshotHandle> {
        let mut inner = self.write()?;
        let documents = Arc::clone(&inner.collection(collection)?.by_rev);
        let id = inner.snapshots.insert(
            SnapshotView {
                collection: collection.to_string(),
                documents,
            },
            ttl,
        );
        Ok(SnapshotHandle::new(id, collection))
    }

    async fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<()> {
        self.write()?.snapshots.remove(handle.id).map(drop)
    }

    async fn snapshot_stats(&self, handle: &SnapshotHandle) -> Result<SnapshotStats> {
        let inner = self.read()?;
        let docs = inner.view(handle)?;
        Ok(SnapshotStats {
            count: docs.len() as u64,
            min_rev: docs.keys().next().copied(),
            max_rev: docs.keys().next_back().copied(),
        })
    }

    async fn snapshot_digests(
        &self,
        handle: &SnapshotHandle,
        range: RevisionRange,
    ) -> Result<Vec<(RevisionId, Digest)>> {
        range.validate()?;
        let inner = self.read()?;
        Ok(inner
            .view(handle)?
            .range(range.min..=range.max)
            .map(|(rev, s)| (*rev, s.digest))
            .collect())
    }

    async fn snapshot_revisions(
        &self,
        handle: &SnapshotHandle,
        range: RevisionRange,
        after: ResumeCursor,
        limit: usize,
    ) -> Result<Vec<RevisionId>> {
        range.validate()?;
        let inner = self.read()?;
        let docs = inner.view(handle)?;
        let Some(start) = page_start(range, after) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .range(start..=range.max)
            .take(limit)
            .map(|(rev, _)| *rev)
            .collect())
    }

    async fn snapshot_documents(
        &self,
        handle: &SnapshotHandle,
        revs: &[RevisionId],
    ) -> Result<Vec<Option<Document>>> {
        let inner = self.read()?;
        let docs = inner.view(handle)?;
        Ok(revs
            .iter()
            .map(|rev| docs.get(rev).map(|s| s.document.as_ref().clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use revtree_core::{body_from_record, CoreError, TreeGeometry, TreeOptions};
    use serde::Serialize;

    #[derive(Serialize)]
    struct UserDoc {
        name: String,
        age: u32,
    }

    fn body(age: u32) -> Value {
        body_from_record(&UserDoc {
            name: "User1".into(),
            age,
        })
        .unwrap()
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_collection("users", CollectionOptions::default())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_revisions() {
        let store = store().await;
        let docs: Vec<_> = (0..10).map(|i| (format!("k{i}"), body(i))).collect();
        let revs = store.insert_documents("users", &docs).await.unwrap();
        assert!(revs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.document_count("users").await.unwrap(), 10);

        let dup = store.insert_document("users", "k3", body(1)).await;
        assert!(matches!(dup, Err(StoreError::DocumentExists { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_writes() {
        let store = store().await;
        let rev = store.insert_document("users", "a", body(1)).await.unwrap();
        let snap = store
            .create_snapshot("users", Duration::from_secs(60))
            .await
            .unwrap();

        let new_rev = store.update_document("users", "a", &body(2)).await.unwrap();
        assert!(new_rev > rev);
        store.insert_document("users", "b", body(3)).await.unwrap();

        let stats = store.snapshot_stats(&snap).await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.bounds(), Some((rev, rev)));
        let docs = store.snapshot_documents(&snap, &[rev, new_rev]).await.unwrap();
        assert_eq!(docs[0].as_ref().unwrap().get("age"), Some(&Value::Integer(1.into())));
        assert!(docs[1].is_none());

        store.delete_snapshot(&snap).await.unwrap();
        assert!(matches!(
            store.snapshot_stats(&snap).await,
            Err(StoreError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_paged_revisions() {
        let store = store().await;
        let docs: Vec<_> = (0..25).map(|i| (format!("k{i}"), body(i))).collect();
        let revs = store.insert_documents("users", &docs).await.unwrap();
        let snap = store
            .create_snapshot("users", Duration::from_secs(60))
            .await
            .unwrap();

        let range = RevisionRange::new(revs[0], revs[24]).unwrap();
        let mut cursor = ResumeCursor::Start;
        let mut seen = Vec::new();
        loop {
            let page = store
                .snapshot_revisions(&snap, range, cursor, 10)
                .await
                .unwrap();
            let Some(last) = page.last().copied() else { break };
            seen.extend(page);
            cursor = ResumeCursor::After(last);
        }
        assert_eq!(seen, revs);
    }

    #[tokio::test]
    async fn test_apply_preserves_revision_and_replaces_key() {
        let store = store().await;
        let local = store.insert_document("users", "a", body(1)).await.unwrap();
        let remote = Document::new("a", RevisionId(local.0 + 1_000), body(9)).unwrap();

        assert_eq!(store.apply_document("users", &remote).await.unwrap(), Some(local));
        assert_eq!(store.apply_document("users", &remote).await.unwrap(), None);
        let doc = store.get_document("users", "a").await.unwrap().unwrap();
        assert_eq!(doc.rev, remote.rev);

        // later local writes sort after the applied revision
        let next = store.update_document("users", "a", &body(2)).await.unwrap();
        assert!(next > remote.rev);
        assert!(store.remove_revision("users", next).await.unwrap());
        assert!(!store.remove_revision("users", next).await.unwrap());
        assert_eq!(store.document_count("users").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_top_revision_still_fits_a_tree() {
        let store = store().await;
        let first = store.insert_document("users", "a", body(1)).await.unwrap();
        let top = Document::new("b", RevisionId::LAST, body(2)).unwrap();
        assert_eq!(store.apply_document("users", &top).await.unwrap(), None);

        let reserved = Document {
            key: "c".into(),
            rev: RevisionId::MAX,
            body: body(3),
        };
        assert!(matches!(
            store.apply_document("users", &reserved).await,
            Err(StoreError::Core(CoreError::InvalidDocument(_)))
        ));
        assert!(matches!(
            store.insert_document("users", "d", body(4)).await,
            Err(StoreError::Core(CoreError::ClockExhausted(_)))
        ));

        let geometry = TreeGeometry::for_population(
            &TreeOptions::default(),
            2,
            Some((first, RevisionId::LAST)),
        )
        .unwrap();
        assert!(geometry.contains(first));
        assert!(geometry.contains(RevisionId::LAST));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_expiry() {
        let store = store().await;
        let snap = store
            .create_snapshot("users", Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(
            store.snapshot_stats(&snap).await,
            Err(StoreError::SnapshotExpired(_))
        ));
        store.delete_snapshot(&snap).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.create_snapshot("nope", Duration::from_secs(1)).await,
            Err(StoreError::CollectionNotFound(_))
        ));
        store
            .create_collection("x", CollectionOptions::legacy())
            .await
            .unwrap();
        assert!(matches!(
            store.create_collection("x", CollectionOptions::default()).await,
            Err(StoreError::CollectionExists(_))
        ));
        assert!(!store.collection_options("x").await.unwrap().revision_tree);
    }
}
