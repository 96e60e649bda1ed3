//! The Replicator: revision-tree replication over one store.
//!
//! The Replicator serves the store's collections to followers and pulls
//! collections from sources, holding every snapshot lease only for the
//! duration of the operation that needs it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use revtree_core::{RevisionTree, SnapshotHandle, TreeOptions};
use revtree_store::Store;
use revtree_sync::{local_tree, LocalSource, RevisionSource, SyncConfig, SyncPlan, SyncReport, SyncSession};

use crate::error::Result;

/// Configuration for the Replicator.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Lease length for snapshots the Replicator opens.
    pub snapshot_ttl: Duration,
    /// Sync configuration.
    pub sync: SyncConfig,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl: Duration::from_secs(60 * 60),
            sync: SyncConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_tree_options(mut self, tree: TreeOptions) -> Self {
        self.sync.tree = tree;
        self
    }
}

/// Replication endpoint over a store.
///
/// Provides:
/// - scoped snapshot leases, local and remote
/// - revision trees of local collections
/// - a [`RevisionSource`] for followers
/// - pulling a collection from any source
pub struct Replicator<S: ?Sized> {
    store: Arc<S>,
    source: Arc<LocalSource<S>>,
    config: ReplicatorConfig,
}

impl<S: Store + 'static> Replicator<S> {
    /// Create a replicator owning `store`.
    pub fn new(store: S, config: ReplicatorConfig) -> Self {
        Self::from_arc(Arc::new(store), config)
    }
}

impl<S: Store + ?Sized + 'static> Replicator<S> {
    /// Create a replicator over a shared store.
    pub fn from_arc(store: Arc<S>, config: ReplicatorConfig) -> Self {
        let source = LocalSource::new(Arc::clone(&store))
            .with_tree_options(config.sync.tree.clone())
            .with_page_size(config.sync.page_size);
        Self {
            store,
            source: Arc::new(source),
            config,
        }
    }

    /// Get the store reference.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// The serving side of this replicator, for followers.
    ///
    /// Trees are cached per snapshot across every holder of the source.
    pub fn source(&self) -> Arc<LocalSource<S>> {
        Arc::clone(&self.source)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshot scopes
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `f` against a fresh local snapshot of `collection`.
    ///
    /// The lease is deleted when `f` finishes, successfully or not, and when
    /// the returned future is dropped early.
    pub async fn with_snapshot<T, F, Fut>(&self, collection: &str, f: F) -> Result<T>
    where
        F: FnOnce(SnapshotHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self
            .store
            .create_snapshot(collection, self.config.snapshot_ttl)
            .await?;
        let lease = LocalLease::new(Arc::clone(&self.store), handle.clone());
        let result = f(handle).await;
        lease.release().await;
        result
    }

    /// Run `f` against a fresh snapshot of `collection` on `remote`.
    ///
    /// The lease is closed when `f` finishes, successfully or not, and when
    /// the returned future is dropped early.
    pub async fn with_remote_snapshot<R, T, F, Fut>(
        &self,
        remote: &Arc<R>,
        collection: &str,
        f: F,
    ) -> Result<T>
    where
        R: RevisionSource + ?Sized + 'static,
        F: FnOnce(SnapshotHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = remote
            .open_snapshot(collection, self.config.snapshot_ttl)
            .await?;
        let lease = RemoteLease::new(Arc::clone(remote), handle.clone());
        let result = f(handle).await;
        lease.release().await;
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trees
    // ─────────────────────────────────────────────────────────────────────────

    /// Build the revision tree of `collection` as it is now.
    pub async fn revision_tree(&self, collection: &str) -> Result<RevisionTree> {
        self.with_snapshot(collection, |snapshot| async move {
            Ok(local_tree(Arc::clone(&self.store), &snapshot, &self.config.sync).await?)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Work out what pulling `collection` from `remote` would change.
    pub async fn plan_from<R>(&self, remote: &Arc<R>, collection: &str) -> Result<SyncPlan>
    where
        R: RevisionSource + ?Sized + 'static,
    {
        self.with_remote_snapshot(remote, collection, |remote_snapshot| async move {
            self.with_snapshot(collection, |local_snapshot| async move {
                let session = SyncSession::new(Arc::clone(&self.store), &**remote, self.config.sync.clone());
                Ok(session.plan(&local_snapshot, &remote_snapshot).await?)
            })
            .await
        })
        .await
    }

    /// Make the local `collection` match `remote`'s.
    ///
    /// Fails with a `NotSupported` error (see
    /// [`crate::ReplicatorError::is_not_supported`]) if either side's
    /// collection does not maintain revision trees.
    pub async fn sync_from<R>(&self, remote: &Arc<R>, collection: &str) -> Result<SyncReport>
    where
        R: RevisionSource + ?Sized + 'static,
    {
        let report = self
            .with_remote_snapshot(remote, collection, |remote_snapshot| async move {
                self.with_snapshot(collection, |local_snapshot| async move {
                    let session =
                        SyncSession::new(Arc::clone(&self.store), &**remote, self.config.sync.clone());
                    Ok(session.run(&local_snapshot, &remote_snapshot).await?)
                })
                .await
            })
            .await?;
        info!(
            collection,
            applied = report.applied,
            removed = report.removed,
            converged = report.converged,
            "pulled collection"
        );
        Ok(report)
    }
}

/// A local lease that is deleted on release or drop.
struct LocalLease<S: Store + ?Sized + 'static> {
    store: Option<Arc<S>>,
    handle: SnapshotHandle,
}

impl<S: Store + ?Sized + 'static> LocalLease<S> {
    fn new(store: Arc<S>, handle: SnapshotHandle) -> Self {
        Self {
            store: Some(store),
            handle,
        }
    }

    async fn release(mut self) {
        if let Some(store) = self.store.take() {
            if let Err(e) = store.delete_snapshot(&self.handle).await {
                warn!(snapshot = %self.handle, error = %e, "failed to delete snapshot");
            }
        }
    }
}

impl<S: Store + ?Sized + 'static> Drop for LocalLease<S> {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        // abandoned mid-operation; delete in the background if we can
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = self.handle.clone();
            runtime.spawn(async move {
                let _ = store.delete_snapshot(&handle).await;
            });
        }
    }
}

/// A remote lease that is closed on release or drop.
struct RemoteLease<R: RevisionSource + ?Sized + 'static> {
    source: Option<Arc<R>>,
    handle: SnapshotHandle,
}

impl<R: RevisionSource + ?Sized + 'static> RemoteLease<R> {
    fn new(source: Arc<R>, handle: SnapshotHandle) -> Self {
        Self {
            source: Some(source),
            handle,
        }
    }

    async fn release(mut self) {
        if let Some(source) = self.source.take() {
            if let Err(e) = source.close_snapshot(&self.handle).await {
                warn!(snapshot = %self.handle, error = %e, "failed to close remote snapshot");
            }
        }
    }
}

impl<R: RevisionSource + ?Sized + 'static> Drop for RemoteLease<R> {
    fn drop(&mut self) {
        let Some(source) = self.source.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = self.handle.clone();
            runtime.spawn(async move {
                if let Err(e) = source.close_snapshot(&handle).await {
                    warn!(snapshot = %handle, error = %e, "failed to close abandoned remote snapshot");
                }
            });
        }
    }
}
