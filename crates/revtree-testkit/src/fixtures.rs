//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::{Arc, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use revtree_core::{RevisionId, RevisionRange, SnapshotHandle};
use revtree_store::{CollectionOptions, MemoryStore, Result, Store, StoreExt};
use revtree_sync::LocalSource;

/// Collection name used by the fixtures.
pub const USERS: &str = "users";

/// Lease length for fixture snapshots.
pub const FIXTURE_TTL: Duration = Duration::from_secs(600);

/// A small typed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDoc {
    pub name: String,
    pub age: u32,
}

/// The `i`-th user and its key.
pub fn user(i: usize) -> (String, UserDoc) {
    (
        format!("user-{i:06}"),
        UserDoc {
            name: format!("User {i}"),
            age: (i % 90) as u32 + 10,
        },
    )
}

/// Users `0..n`.
pub fn users(n: usize) -> Vec<(String, UserDoc)> {
    (0..n).map(user).collect()
}

/// A memory store with one revision-tree collection.
pub struct TestFixture {
    pub store: Arc<MemoryStore>,
    pub collection: String,
}

impl TestFixture {
    /// An empty `users` collection.
    pub async fn new() -> Result<Self> {
        Self::with_options(CollectionOptions::default()).await
    }

    /// An empty `users` collection with explicit options.
    pub async fn with_options(options: CollectionOptions) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        store.create_collection(USERS, options).await?;
        Ok(Self {
            store,
            collection: USERS.to_string(),
        })
    }

    /// `users(n)` inserted in one batch; returns their revisions in order.
    pub async fn with_users(n: usize) -> Result<(Self, Vec<RevisionId>)> {
        let fixture = Self::new().await?;
        let revs = fixture.insert_users(0..n).await?;
        Ok((fixture, revs))
    }

    /// Insert the users with the given indices.
    pub async fn insert_users(&self, indices: std::ops::Range<usize>) -> Result<Vec<RevisionId>> {
        let records: Vec<_> = indices.map(user).collect();
        self.store.insert_records(&self.collection, &records).await
    }

    /// A snapshot of the collection as it is now.
    pub async fn snapshot(&self) -> Result<SnapshotHandle> {
        self.store.create_snapshot(&self.collection, FIXTURE_TTL).await
    }

    /// A serving source over the store.
    pub fn source(&self) -> LocalSource<MemoryStore> {
        LocalSource::new(Arc::clone(&self.store))
    }

    /// A second store holding exactly the same documents, revisions included.
    pub async fn mirror(&self) -> Result<TestFixture> {
        let copy = TestFixture::new().await?;
        let snapshot = self.snapshot().await?;
        let revs: Vec<_> = self
            .store
            .snapshot_digests(&snapshot, RevisionRange::FULL)
            .await?
            .into_iter()
            .map(|(rev, _)| rev)
            .collect();
        for document in self
            .store
            .snapshot_documents(&snapshot, &revs)
            .await?
            .into_iter()
            .flatten()
        {
            copy.store.apply_document(&copy.collection, &document).await?;
        }
        self.store.delete_snapshot(&snapshot).await?;
        Ok(copy)
    }

    /// Number of live documents.
    pub async fn count(&self) -> Result<u64> {
        self.store.document_count(&self.collection).await
    }
}

/// Install a `tracing` subscriber for tests, once per process. Warnings and
/// above go to the test writer.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::WARN)
            .try_init();
    });
}
