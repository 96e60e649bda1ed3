//! Anti-entropy session between a local store and a revision source.
//!
//! A session compares the two snapshots' revision trees, narrows the
//! disagreement down to leaf ranges, resolves those ranges into revisions on
//! both sides, and repairs the local store: documents only the source has are
//! fetched and applied with their revisions, revisions only the local side has
//! are removed.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use revtree_core::{
    coalesce, diff, RevisionId, RevisionRange, RevisionTree, Revisions, SnapshotHandle,
    TreeGeometry, TreeOptions,
};
use revtree_store::Store;

use crate::build::build_aligned_tree;
use crate::error::{Result, SyncError};
use crate::fetcher::DocumentFetcher;
use crate::messages::limits;
use crate::resolver::RangeResolver;
use crate::source::{LocalSource, RevisionSource, DEFAULT_PAGE_SIZE};

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Revisions per page when serving local ranges.
    pub page_size: usize,
    /// Revisions per document request.
    pub fetch_batch_size: usize,
    /// Deadline for resolving one group of ranges, shared by all of its
    /// pages. A lone `RangeResolver::next_page` call gets a fresh one.
    pub resolve_timeout: Duration,
    /// Deadline for one chunk of a document fetch.
    pub fetch_timeout: Duration,
    /// First back-off step when the source is not ready.
    pub poll_interval: Duration,
    /// Back-off cap.
    pub max_poll_interval: Duration,
    /// Shape of locally built trees.
    pub tree: TreeOptions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fetch_batch_size: 1_000,
            resolve_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_secs(1),
            tree: TreeOptions::default(),
        }
    }
}

impl SyncConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_fetch_batch_size(mut self, batch: usize) -> Self {
        self.fetch_batch_size = batch.max(1);
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, first: Duration, max: Duration) -> Self {
        self.poll_interval = first;
        self.max_poll_interval = max.max(first);
        self
    }

    pub fn with_tree_options(mut self, tree: TreeOptions) -> Self {
        self.tree = tree;
        self
    }
}

/// What a session found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Live revisions in the remote snapshot.
    pub remote_count: u64,
    /// Live revisions in the local snapshot.
    pub local_count: u64,
    /// Coalesced ranges that had to be resolved.
    pub differing_ranges: usize,
    /// Documents fetched from the remote.
    pub fetched: usize,
    /// Documents newly applied locally.
    pub applied: usize,
    /// Local revisions that stopped being live.
    pub removed: usize,
    /// Whether the trees already agreed.
    pub converged: bool,
}

/// The repair a session would make.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// The remote tree the plan was computed against.
    pub remote_geometry: Option<TreeGeometry>,
    pub remote_count: u64,
    pub local_count: u64,
    /// Ranges resolved on both sides, ascending.
    pub differing: Vec<RevisionRange>,
    /// Revisions the remote has and the local side lacks.
    pub missing: Revisions,
    /// Revisions the local side has and the remote lacks.
    pub stale: Revisions,
}

impl SyncPlan {
    pub fn is_converged(&self) -> bool {
        self.differing.is_empty()
    }
}

/// Reconciles one local collection against a revision source.
pub struct SyncSession<S: ?Sized, R> {
    store: Arc<S>,
    source: R,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl<S, R> SyncSession<S, R>
where
    S: Store + ?Sized + 'static,
    R: RevisionSource,
{
    pub fn new(store: Arc<S>, source: R, config: SyncConfig) -> Self {
        Self {
            store,
            source,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Compare `local` (a snapshot of the local store) with `remote` (a
    /// snapshot on the source) without changing anything.
    #[instrument(skip_all, fields(local = %local, remote = %remote))]
    pub async fn plan(&self, local: &SnapshotHandle, remote: &SnapshotHandle) -> Result<SyncPlan> {
        let remote_tree = self.source.revision_tree(remote).await?;
        remote_tree
            .validate()
            .map_err(|e| SyncError::InvalidMessage(format!("remote tree: {e}")))?;
        let geometry = remote_tree.geometry();

        let local_tree =
            build_aligned_tree(Arc::clone(&self.store), local, geometry, &self.cancel).await?;
        let local_count = self.store.snapshot_stats(local).await?.count;

        // local revisions outside the remote tree are invisible to the diff
        let outliers = local_count > local_tree.count();
        let (below, above) = outside(&geometry);
        let mut ranges = Vec::new();
        if outliers {
            ranges.extend(below);
        }
        ranges.extend(diff(&local_tree, &remote_tree)?);
        if outliers {
            ranges.push(above);
        }
        let differing = coalesce(&ranges);

        let mut plan = SyncPlan {
            remote_geometry: Some(geometry),
            remote_count: remote_tree.count(),
            local_count,
            differing,
            ..SyncPlan::default()
        };
        if plan.differing.is_empty() {
            debug!(count = local_count, "trees agree");
            return Ok(plan);
        }

        let remote_revs = self.resolve(&self.source, remote, &plan.differing).await?;
        let local_source = LocalSource::new(Arc::clone(&self.store))
            .with_page_size(self.config.page_size)
            .with_cancellation(self.cancel.clone());
        let local_revs = self.resolve(&local_source, local, &plan.differing).await?;

        let (missing, stale) = sorted_difference(&remote_revs, &local_revs);
        plan.missing = missing;
        plan.stale = stale;
        debug!(
            ranges = plan.differing.len(),
            missing = plan.missing.len(),
            stale = plan.stale.len(),
            "planned repair"
        );
        Ok(plan)
    }

    /// Bring the local collection in line with the remote snapshot.
    #[instrument(skip_all, fields(local = %local, remote = %remote))]
    pub async fn run(&self, local: &SnapshotHandle, remote: &SnapshotHandle) -> Result<SyncReport> {
        let plan = self.plan(local, remote).await?;
        let mut report = SyncReport {
            remote_count: plan.remote_count,
            local_count: plan.local_count,
            differing_ranges: plan.differing.len(),
            converged: plan.is_converged(),
            ..SyncReport::default()
        };
        if report.converged {
            info!(count = report.local_count, "already in sync");
            return Ok(report);
        }

        let collection = local.collection.as_str();
        let fetcher = DocumentFetcher::new(&self.source, remote.clone(), &self.config)
            .with_cancellation(self.cancel.clone());
        for chunk in plan.missing.chunks(fetcher.batch_size()) {
            let documents = fetcher.fetch_chunk(chunk).await?;
            report.fetched += documents.len();
            for document in &documents {
                if self.cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                // the replaced revision is stale too and will not need removing
                if self.store.apply_document(collection, document).await?.is_some() {
                    report.removed += 1;
                }
                report.applied += 1;
            }
        }

        for rev in &plan.stale {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if self.store.remove_revision(collection, *rev).await? {
                report.removed += 1;
            }
        }

        info!(
            remote = report.remote_count,
            local = report.local_count,
            ranges = report.differing_ranges,
            applied = report.applied,
            removed = report.removed,
            "sync complete"
        );
        Ok(report)
    }

    /// All revisions in `ranges`, ascending. Queries stay within the wire
    /// limit on ranges per request.
    async fn resolve<T: RevisionSource>(
        &self,
        source: T,
        snapshot: &SnapshotHandle,
        ranges: &[RevisionRange],
    ) -> Result<Revisions> {
        let mut out = Vec::new();
        for group in ranges.chunks(limits::MAX_RANGES_PER_QUERY) {
            let mut resolver =
                RangeResolver::new(&source, snapshot.clone(), group.to_vec(), &self.config)?
                    .with_cancellation(self.cancel.clone());
            out.extend(resolver.resolve_all().await?.into_iter().flatten());
        }
        Ok(out)
    }
}

/// Revisions below and above what `geometry` covers.
fn outside(geometry: &TreeGeometry) -> (Option<RevisionRange>, RevisionRange) {
    let below = (geometry.range_min > RevisionRange::FULL.min).then(|| RevisionRange {
        min: RevisionRange::FULL.min,
        max: geometry.range_min.saturating_prev(),
    });
    let above = RevisionRange {
        min: geometry.range_max,
        max: RevisionId::MAX,
    };
    (below, above)
}

/// `(a - b, b - a)` of two ascending lists.
pub fn sorted_difference(a: &[RevisionId], b: &[RevisionId]) -> (Revisions, Revisions) {
    let (mut only_a, mut only_b) = (Vec::new(), Vec::new());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => {
                only_a.push(a[i]);
                i += 1;
            }
            Ordering::Greater => {
                only_b.push(b[j]);
                j += 1;
            }
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    only_a.extend_from_slice(&a[i..]);
    only_b.extend_from_slice(&b[j..]);
    (only_a, only_b)
}

/// Build a tree over a local snapshot sized for its own population.
pub async fn local_tree<S: Store + ?Sized + 'static>(
    store: Arc<S>,
    snapshot: &SnapshotHandle,
    config: &SyncConfig,
) -> Result<RevisionTree> {
    crate::build::build_tree(store, snapshot, &config.tree, &CancellationToken::new()).await
}
