//! Misbehaving revision sources for exercising deadlines and retries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use revtree_core::{Document, ResumeCursor, RevisionId, RevisionRange, RevisionTree, SnapshotHandle};
use revtree_sync::{Result, RevisionPage, RevisionSource, SyncError};

/// Take one unit from `budget`; `true` while any was left.
fn spend(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Answers range queries with empty, not-yet-ready pages a number of times
/// before serving real ones.
pub struct StallingSource<R> {
    inner: R,
    stalls: AtomicUsize,
}

impl<R> StallingSource<R> {
    pub fn new(inner: R, stalls: usize) -> Self {
        Self {
            inner,
            stalls: AtomicUsize::new(stalls),
        }
    }

    /// Never produces a page.
    pub fn forever(inner: R) -> Self {
        Self::new(inner, usize::MAX)
    }
}

#[async_trait]
impl<R: RevisionSource> RevisionSource for StallingSource<R> {
    async fn open_snapshot(&self, collection: &str, ttl: Duration) -> Result<SnapshotHandle> {
        self.inner.open_snapshot(collection, ttl).await
    }

    async fn close_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()> {
        self.inner.close_snapshot(snapshot).await
    }

    async fn revision_tree(&self, snapshot: &SnapshotHandle) -> Result<RevisionTree> {
        self.inner.revision_tree(snapshot).await
    }

    async fn revisions_by_ranges(
        &self,
        snapshot: &SnapshotHandle,
        ranges: &[RevisionRange],
        resume: ResumeCursor,
    ) -> Result<RevisionPage> {
        if spend(&self.stalls) {
            return Ok(RevisionPage {
                ranges: vec![Vec::new(); ranges.len()],
                next: Some(resume),
            });
        }
        self.inner.revisions_by_ranges(snapshot, ranges, resume).await
    }

    async fn revision_documents(
        &self,
        snapshot: &SnapshotHandle,
        revs: &[RevisionId],
    ) -> Result<Vec<Document>> {
        self.inner.revision_documents(snapshot, revs).await
    }
}

/// Fails range and document requests with `Transient` errors until its
/// failure budget is spent.
pub struct FlakySource<R> {
    inner: R,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl<R> FlakySource<R> {
    pub fn new(inner: R, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    /// Range and document requests received, failed or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if spend(&self.failures) {
            return Err(SyncError::Transient(format!("injected failure on call {call}")));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: RevisionSource> RevisionSource for FlakySource<R> {
    async fn open_snapshot(&self, collection: &str, ttl: Duration) -> Result<SnapshotHandle> {
        self.inner.open_snapshot(collection, ttl).await
    }

    async fn close_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()> {
        self.inner.close_snapshot(snapshot).await
    }

    async fn revision_tree(&self, snapshot: &SnapshotHandle) -> Result<RevisionTree> {
        self.inner.revision_tree(snapshot).await
    }

    async fn revisions_by_ranges(
        &self,
        snapshot: &SnapshotHandle,
        ranges: &[RevisionRange],
        resume: ResumeCursor,
    ) -> Result<RevisionPage> {
        self.trip()?;
        self.inner.revisions_by_ranges(snapshot, ranges, resume).await
    }

    async fn revision_documents(
        &self,
        snapshot: &SnapshotHandle,
        revs: &[RevisionId],
    ) -> Result<Vec<Document>> {
        self.trip()?;
        self.inner.revision_documents(snapshot, revs).await
    }
}
