//! Revision sources: anything that can serve a snapshot's tree, revisions
//! and documents.
//!
//! [`LocalSource`] serves straight from a [`Store`]. The transport module
//! provides a remote implementation over any [`crate::Transport`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use revtree_core::{
    validate_ranges, Document, ResumeCursor, RevisionId, RevisionRange, RevisionTree,
    SnapshotHandle, SnapshotId, TreeOptions,
};
use revtree_store::Store;

use crate::build::build_tree;
use crate::error::{Result, SyncError};
use crate::messages::RevisionPage;

/// Default number of revisions per page.
pub const DEFAULT_PAGE_SIZE: usize = 5_000;

/// The serving side of replication.
#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// Lease a consistent view of `collection`.
    async fn open_snapshot(&self, collection: &str, ttl: Duration) -> Result<SnapshotHandle>;

    /// Release a lease.
    async fn close_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()>;

    /// The snapshot's revision tree.
    async fn revision_tree(&self, snapshot: &SnapshotHandle) -> Result<RevisionTree>;

    /// One page of live revisions in `ranges`, strictly after `resume`.
    ///
    /// `ranges` must be ascending and disjoint.
    async fn revisions_by_ranges(
        &self,
        snapshot: &SnapshotHandle,
        ranges: &[RevisionRange],
        resume: ResumeCursor,
    ) -> Result<RevisionPage>;

    /// The documents for `revs`, positionally aligned.
    async fn revision_documents(
        &self,
        snapshot: &SnapshotHandle,
        revs: &[RevisionId],
    ) -> Result<Vec<Document>>;
}

macro_rules! forward_source {
    ($($ty:ty),*) => {$(
        #[async_trait]
        impl<T: RevisionSource + ?Sized> RevisionSource for $ty {
            async fn open_snapshot(&self, collection: &str, ttl: Duration) -> Result<SnapshotHandle> {
                (**self).open_snapshot(collection, ttl).await
            }

            async fn close_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()> {
                (**self).close_snapshot(snapshot).await
            }

            async fn revision_tree(&self, snapshot: &SnapshotHandle) -> Result<RevisionTree> {
                (**self).revision_tree(snapshot).await
            }

            async fn revisions_by_ranges(
                &self,
                snapshot: &SnapshotHandle,
                ranges: &[RevisionRange],
                resume: ResumeCursor,
            ) -> Result<RevisionPage> {
                (**self).revisions_by_ranges(snapshot, ranges, resume).await
            }

            async fn revision_documents(
                &self,
                snapshot: &SnapshotHandle,
                revs: &[RevisionId],
            ) -> Result<Vec<Document>> {
                (**self).revision_documents(snapshot, revs).await
            }
        }
    )*};
}

forward_source!(&T, Arc<T>);

/// Serves replication requests from a local store.
///
/// Trees are built once per snapshot and cached until the snapshot is closed
/// through this source, or its lease is found expired or gone. Builds for
/// different snapshots run concurrently.
pub struct LocalSource<S: ?Sized> {
    store: Arc<S>,
    options: TreeOptions,
    page_size: usize,
    cancel: CancellationToken,
    trees: Mutex<HashMap<SnapshotId, CachedTree>>,
}

/// A snapshot's tree, built at most once.
struct CachedTree {
    snapshot: SnapshotHandle,
    tree: Arc<OnceCell<Arc<RevisionTree>>>,
}

/// Whether `err` means the lease behind a snapshot is no longer usable.
fn lease_gone(err: &SyncError) -> bool {
    matches!(err, SyncError::SnapshotExpired(_) | SyncError::SnapshotNotFound(_))
}

impl<S: Store + ?Sized + 'static> LocalSource<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            options: TreeOptions::default(),
            page_size: DEFAULT_PAGE_SIZE,
            cancel: CancellationToken::new(),
            trees: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tree_options(mut self, options: TreeOptions) -> Self {
        self.options = options;
        self
    }

    /// Cap on revisions per page; at least one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Token that aborts tree builds in progress.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Drop cached trees whose leases have expired or been deleted.
    async fn evict_stale(&self) {
        let cached: Vec<SnapshotHandle> = self
            .trees
            .lock()
            .await
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        let mut gone = Vec::new();
        for snapshot in cached {
            if let Err(e) = self.store.snapshot_stats(&snapshot).await {
                if lease_gone(&SyncError::from(e)) {
                    gone.push(snapshot.id);
                }
            }
        }
        if !gone.is_empty() {
            let mut trees = self.trees.lock().await;
            for id in &gone {
                trees.remove(id);
            }
            debug!(evicted = gone.len(), "dropped trees of lapsed snapshots");
        }
    }

    async fn forget(&self, snapshot: &SnapshotHandle) {
        self.trees.lock().await.remove(&snapshot.id);
    }

    async fn require_support(&self, snapshot: &SnapshotHandle) -> Result<()> {
        let options = self.store.collection_options(&snapshot.collection).await?;
        if !options.revision_tree {
            return Err(SyncError::NotSupported(snapshot.collection.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Store + ?Sized + 'static> RevisionSource for LocalSource<S> {
    async fn open_snapshot(&self, collection: &str, ttl: Duration) -> Result<SnapshotHandle> {
        self.evict_stale().await;
        Ok(self.store.create_snapshot(collection, ttl).await?)
    }

    async fn close_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()> {
        self.forget(snapshot).await;
        Ok(self.store.delete_snapshot(snapshot).await?)
    }

    async fn revision_tree(&self, snapshot: &SnapshotHandle) -> Result<RevisionTree> {
        self.require_support(snapshot).await?;

        // the lease may have lapsed since the tree was cached
        if let Err(e) = self.store.snapshot_stats(snapshot).await {
            let err = SyncError::from(e);
            if lease_gone(&err) {
                self.forget(snapshot).await;
            }
            return Err(err);
        }

        let cell = {
            let mut trees = self.trees.lock().await;
            let entry = trees.entry(snapshot.id).or_insert_with(|| CachedTree {
                snapshot: snapshot.clone(),
                tree: Arc::new(OnceCell::new()),
            });
            Arc::clone(&entry.tree)
        };
        let built = cell
            .get_or_try_init(|| async {
                build_tree(Arc::clone(&self.store), snapshot, &self.options, &self.cancel)
                    .await
                    .map(Arc::new)
            })
            .await;
        match built {
            Ok(tree) => Ok(tree.as_ref().clone()),
            Err(e) => {
                if lease_gone(&e) {
                    self.forget(snapshot).await;
                }
                Err(e)
            }
        }
    }

    async fn revisions_by_ranges(
        &self,
        snapshot: &SnapshotHandle,
        ranges: &[RevisionRange],
        resume: ResumeCursor,
    ) -> Result<RevisionPage> {
        self.require_support(snapshot).await?;
        validate_ranges(ranges)?;

        let mut remaining = self.page_size;
        let mut more = false;
        let mut last = None;
        let mut out = Vec::with_capacity(ranges.len());
        for range in ranges {
            if more {
                out.push(Vec::new());
                continue;
            }
            // one extra to learn whether anything is left
            let mut revs = self
                .store
                .snapshot_revisions(snapshot, *range, resume, remaining + 1)
                .await?;
            if revs.len() > remaining {
                revs.truncate(remaining);
                more = true;
            }
            remaining -= revs.len();
            if let Some(rev) = revs.last() {
                last = Some(*rev);
            }
            out.push(revs);
        }

        let next = match (more, last) {
            (false, _) => None,
            (true, Some(rev)) => Some(ResumeCursor::After(rev)),
            (true, None) => Some(resume),
        };
        debug!(
            snapshot = %snapshot,
            ranges = ranges.len(),
            emitted = self.page_size - remaining,
            terminal = next.is_none(),
            "served revision page"
        );
        Ok(RevisionPage { ranges: out, next })
    }

    async fn revision_documents(
        &self,
        snapshot: &SnapshotHandle,
        revs: &[RevisionId],
    ) -> Result<Vec<Document>> {
        self.require_support(snapshot).await?;
        let found = self.store.snapshot_documents(snapshot, revs).await?;
        found
            .into_iter()
            .zip(revs)
            .map(|(doc, rev)| doc.ok_or(SyncError::UnknownRevision(*rev)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revtree_core::Value;
    use revtree_store::{CollectionOptions, MemoryStore};

    async fn source(n: u32, page_size: usize) -> (LocalSource<MemoryStore>, SnapshotHandle, Vec<RevisionId>) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_collection("c", CollectionOptions::default())
            .await
            .unwrap();
        let docs: Vec<_> = (0..n)
            .map(|i| {
                let body = Value::Map(vec![(Value::Text("i".into()), Value::Integer(i.into()))]);
                (format!("k{i}"), body)
            })
            .collect();
        let revs = store.insert_documents("c", &docs).await.unwrap();
        let source = LocalSource::new(store).with_page_size(page_size);
        let snapshot = source
            .open_snapshot("c", Duration::from_secs(60))
            .await
            .unwrap();
        (source, snapshot, revs)
    }

    fn range(min: RevisionId, max: RevisionId) -> RevisionRange {
        RevisionRange::new(min, max).unwrap()
    }

    #[tokio::test]
    async fn test_pages_across_ranges() {
        let (source, snapshot, revs) = source(30, 7).await;
        let ranges = vec![range(revs[0], revs[9]), range(revs[20], revs[29])];

        let mut cursor = ResumeCursor::Start;
        let mut per_range = vec![Vec::new(), Vec::new()];
        let mut pages = 0;
        loop {
            let page = source
                .revisions_by_ranges(&snapshot, &ranges, cursor)
                .await
                .unwrap();
            assert!(page.len() <= 7);
            pages += 1;
            for (acc, revs) in per_range.iter_mut().zip(page.ranges) {
                acc.extend(revs);
            }
            match page.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(per_range[0], revs[..10]);
        assert_eq!(per_range[1], revs[20..]);
    }

    #[tokio::test]
    async fn test_exact_fill_is_terminal() {
        let (source, snapshot, revs) = source(5, 5).await;
        let page = source
            .revisions_by_ranges(&snapshot, &[RevisionRange::FULL], ResumeCursor::Start)
            .await
            .unwrap();
        assert_eq!(page.ranges[0], revs);
        assert!(page.is_terminal());
    }

    #[tokio::test]
    async fn test_rejects_bad_ranges() {
        let (source, snapshot, revs) = source(5, 5).await;
        let overlapping = [range(revs[0], revs[3]), range(revs[2], revs[4])];
        let err = source
            .revisions_by_ranges(&snapshot, &overlapping, ResumeCursor::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRange(_)));

        let inverted = [RevisionRange {
            min: revs[3],
            max: revs[1],
        }];
        let err = source
            .revisions_by_ranges(&snapshot, &inverted, ResumeCursor::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRange(_)));
    }

    #[tokio::test]
    async fn test_documents_positional_and_unknown() {
        let (source, snapshot, revs) = source(5, 5).await;
        let wanted = [revs[3], revs[0], revs[4]];
        let docs = source.revision_documents(&snapshot, &wanted).await.unwrap();
        assert_eq!(docs.iter().map(|d| d.rev).collect::<Vec<_>>(), wanted);

        let bogus = RevisionId(revs[4].0 + 1);
        let err = source
            .revision_documents(&snapshot, &[revs[0], bogus])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownRevision(r) if r == bogus));
    }

    #[tokio::test]
    async fn test_tree_cached_until_close() {
        let (source, snapshot, _) = source(50, 10).await;
        let first = source.revision_tree(&snapshot).await.unwrap();
        let second = source.revision_tree(&snapshot).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.count(), 50);

        source.close_snapshot(&snapshot).await.unwrap();
        let err = source.revision_tree(&snapshot).await.unwrap_err();
        assert!(matches!(err, SyncError::SnapshotNotFound(_)));
    }

    #[tokio::test]
    async fn test_legacy_collection_not_supported() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_collection("old", CollectionOptions::legacy())
            .await
            .unwrap();
        let source = LocalSource::new(store);
        let snapshot = source
            .open_snapshot("old", Duration::from_secs(60))
            .await
            .unwrap();
        let err = source.revision_tree(&snapshot).await.unwrap_err();
        assert!(err.is_not_supported());
        let err = source
            .revisions_by_ranges(&snapshot, &[RevisionRange::FULL], ResumeCursor::Start)
            .await
            .unwrap_err();
        assert!(err.is_not_supported());
    }

    #[tokio::test]
    async fn test_independent_snapshots_do_not_wait_on_each_other() {
        let (source, first, _) = source(20, 10).await;
        let second = source
            .open_snapshot("c", Duration::from_secs(60))
            .await
            .unwrap();
        source.revision_tree(&second).await.unwrap();

        // a build of `first` that never finishes
        let cell = {
            let mut trees = source.trees.lock().await;
            let entry = trees.entry(first.id).or_insert_with(|| CachedTree {
                snapshot: first.clone(),
                tree: Arc::new(OnceCell::new()),
            });
            Arc::clone(&entry.tree)
        };
        let building = tokio::spawn(async move {
            cell.get_or_init(|| std::future::pending()).await;
        });
        tokio::task::yield_now().await;

        let tree = tokio::time::timeout(Duration::from_secs(5), source.revision_tree(&second))
            .await
            .expect("cached tree served while another snapshot builds")
            .unwrap();
        assert_eq!(tree.count(), 20);

        let third = source
            .open_snapshot("c", Duration::from_secs(60))
            .await
            .unwrap();
        let tree = tokio::time::timeout(Duration::from_secs(5), source.revision_tree(&third))
            .await
            .expect("fresh build runs while another snapshot builds")
            .unwrap();
        assert_eq!(tree.count(), 20);
        building.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_snapshot_trees_evicted() {
        let (source, long_lived, _) = source(20, 10).await;
        let short = source
            .open_snapshot("c", Duration::from_secs(5))
            .await
            .unwrap();
        source.revision_tree(&short).await.unwrap();
        source.revision_tree(&long_lived).await.unwrap();
        assert_eq!(source.trees.lock().await.len(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        let err = source.revision_tree(&short).await.unwrap_err();
        assert!(matches!(err, SyncError::SnapshotExpired(_)));
        assert_eq!(source.trees.lock().await.len(), 1);

        // deleted behind the source's back, then swept on the next open
        source.store().delete_snapshot(&long_lived).await.unwrap();
        let fresh = source
            .open_snapshot("c", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(source.trees.lock().await.is_empty());
        source.revision_tree(&fresh).await.unwrap();
        assert_eq!(source.trees.lock().await.len(), 1);
    }
}
