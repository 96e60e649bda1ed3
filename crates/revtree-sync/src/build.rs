//! Parallel revision-tree construction over a store snapshot.
//!
//! The leaf space is split into one slice per top-level branch. Each slice is
//! filled by its own task from the store's digests, then the slices are
//! merged and the internal levels derived. The result does not depend on task
//! completion order.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use revtree_core::{LeafBatch, RevisionTree, SnapshotHandle, TreeBuilder, TreeGeometry, TreeOptions};
use revtree_store::Store;

use crate::error::{Result, SyncError};

/// Build the tree of a snapshot, sized for its population.
#[instrument(skip_all, fields(snapshot = %snapshot))]
pub async fn build_tree<S>(
    store: Arc<S>,
    snapshot: &SnapshotHandle,
    options: &TreeOptions,
    cancel: &CancellationToken,
) -> Result<RevisionTree>
where
    S: Store + ?Sized + 'static,
{
    let stats = store.snapshot_stats(snapshot).await?;
    let geometry = TreeGeometry::for_population(options, stats.count, stats.bounds())?;
    debug!(
        count = stats.count,
        depth = geometry.max_depth,
        leaf_width = geometry.leaf_width(),
        "chose tree geometry"
    );
    build_aligned_tree(store, snapshot, geometry, cancel).await
}

/// Build the tree of a snapshot with a fixed geometry.
///
/// Revisions outside the geometry's range are left out.
#[instrument(skip_all, fields(snapshot = %snapshot, depth = geometry.max_depth))]
pub async fn build_aligned_tree<S>(
    store: Arc<S>,
    snapshot: &SnapshotHandle,
    geometry: TreeGeometry,
    cancel: &CancellationToken,
) -> Result<RevisionTree>
where
    S: Store + ?Sized + 'static,
{
    geometry.validate()?;

    let mut tasks = JoinSet::new();
    for span in geometry.top_level_spans() {
        let store = Arc::clone(&store);
        let snapshot = snapshot.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let mut batch = LeafBatch::new(geometry, span);
            let digests = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                digests = store.snapshot_digests(&snapshot, batch.revisions()) => digests?,
            };
            for (rev, digest) in &digests {
                batch.add(*rev, digest)?;
            }
            Ok::<_, SyncError>(batch)
        });
    }

    let mut builder = TreeBuilder::new(geometry);
    while let Some(joined) = tasks.join_next().await {
        let batch = joined.map_err(|e| SyncError::Internal(format!("build task: {e}")))??;
        builder.absorb(batch)?;
    }
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let tree = builder.finish();
    debug!(count = tree.count(), nodes = tree.nodes.len(), "built revision tree");
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use revtree_core::{build_tree as build_sequential, Value};
    use revtree_store::{CollectionOptions, MemoryStore};

    async fn populated(n: u32) -> (Arc<MemoryStore>, SnapshotHandle) {
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
        store.insert_documents("c", &docs).await.unwrap();
        let snapshot = store
            .create_snapshot("c", Duration::from_secs(60))
            .await
            .unwrap();
        (store, snapshot)
    }

    #[tokio::test]
    async fn test_parallel_build_matches_sequential() {
        let (store, snapshot) = populated(2_000).await;
        let options = TreeOptions::default();
        let parallel = build_tree(store.clone(), &snapshot, &options, &CancellationToken::new())
            .await
            .unwrap();

        let entries = store
            .snapshot_digests(&snapshot, revtree_core::RevisionRange::FULL)
            .await
            .unwrap();
        let sequential = build_sequential(&options, &entries).unwrap();
        assert_eq!(parallel, sequential);
        assert_eq!(parallel.count(), 2_000);
    }

    #[tokio::test]
    async fn test_aligned_build_drops_outliers() {
        let (store, snapshot) = populated(100).await;
        let entries = store
            .snapshot_digests(&snapshot, revtree_core::RevisionRange::FULL)
            .await
            .unwrap();
        // a geometry covering only the first half of the revisions
        let mid = entries[49].0;
        let geometry =
            TreeGeometry::new(entries[0].0, mid.saturating_next(), 0, 8).unwrap();
        let tree = build_aligned_tree(store, &snapshot, geometry, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tree.count(), 50);
    }

    #[tokio::test]
    async fn test_cancelled_build() {
        let (store, snapshot) = populated(10).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = build_tree(store, &snapshot, &TreeOptions::default(), &cancel).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_build_on_deleted_snapshot() {
        let (store, snapshot) = populated(10).await;
        store.delete_snapshot(&snapshot).await.unwrap();
        let result = build_tree(store, &snapshot, &TreeOptions::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SyncError::SnapshotNotFound(_))));
    }
}
