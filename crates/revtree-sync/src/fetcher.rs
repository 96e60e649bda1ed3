//! Chunked document materialization.

use std::time::Duration;

use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use revtree_core::{Document, RevisionId, SnapshotHandle};

use crate::error::{Result, SyncError};
use crate::protocol::SyncConfig;
use crate::source::RevisionSource;

/// Fetches documents by revision, in request-sized chunks.
pub struct DocumentFetcher<R> {
    source: R,
    snapshot: SnapshotHandle,
    batch_size: usize,
    timeout: Duration,
    poll_interval: Duration,
    max_poll_interval: Duration,
    cancel: CancellationToken,
}

impl<R: RevisionSource> DocumentFetcher<R> {
    pub fn new(source: R, snapshot: SnapshotHandle, config: &SyncConfig) -> Self {
        Self {
            source,
            snapshot,
            batch_size: config.fetch_batch_size.max(1),
            timeout: config.fetch_timeout,
            poll_interval: config.poll_interval,
            max_poll_interval: config.max_poll_interval.max(config.poll_interval),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fetch every revision in `revs`; the result is aligned with the input.
    #[instrument(skip_all, fields(snapshot = %self.snapshot, revisions = revs.len()))]
    pub async fn fetch(&self, revs: &[RevisionId]) -> Result<Vec<Document>> {
        let mut out = Vec::with_capacity(revs.len());
        for chunk in revs.chunks(self.batch_size) {
            out.extend(self.fetch_chunk(chunk).await?);
        }
        debug!(fetched = out.len(), "fetched documents");
        Ok(out)
    }

    /// Fetch one chunk, retrying transient failures until the fetch deadline.
    pub async fn fetch_chunk(&self, revs: &[RevisionId]) -> Result<Vec<Document>> {
        if revs.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + self.timeout;
        let mut delay = self.poll_interval;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let call = self.source.revision_documents(&self.snapshot, revs);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                outcome = timeout_at(deadline, call) => outcome,
            };
            match outcome {
                Err(_) => return Err(self.timed_out(revs.len())),
                Ok(Ok(docs)) => {
                    check_alignment(revs, &docs)?;
                    return Ok(docs);
                }
                Ok(Err(SyncError::Transient(reason))) => {
                    warn!(snapshot = %self.snapshot, %reason, "transient fetch failure");
                }
                Ok(Err(e)) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(revs.len()));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = sleep_until(deadline.min(now + delay)) => {}
            }
            delay = (delay * 2).min(self.max_poll_interval);
        }
    }

    fn timed_out(&self, n: usize) -> SyncError {
        SyncError::Timeout(format!("fetching {n} documents from {}", self.snapshot))
    }
}

fn check_alignment(revs: &[RevisionId], docs: &[Document]) -> Result<()> {
    if docs.len() != revs.len() {
        return Err(SyncError::InvalidMessage(format!(
            "asked for {} documents, got {}",
            revs.len(),
            docs.len()
        )));
    }
    if let Some((want, doc)) = revs.iter().zip(docs).find(|(want, doc)| doc.rev != **want) {
        return Err(SyncError::InvalidMessage(format!(
            "expected revision {want}, got {}",
            doc.rev
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use revtree_core::{ResumeCursor, RevisionRange, RevisionTree, SnapshotId, Value};
    use revtree_store::{CollectionOptions, MemoryStore, Store};

    use crate::messages::RevisionPage;
    use crate::source::LocalSource;

    async fn local(n: u32) -> (Arc<LocalSource<MemoryStore>>, SnapshotHandle, Vec<RevisionId>) {
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
        let source = Arc::new(LocalSource::new(store));
        let snapshot = source
            .open_snapshot("c", Duration::from_secs(60))
            .await
            .unwrap();
        (source, snapshot, revs)
    }

    /// Answers document requests with a fixed transform of the truth.
    struct Tampered<F> {
        inner: Arc<LocalSource<MemoryStore>>,
        failures: AtomicUsize,
        tamper: F,
    }

    #[async_trait]
    impl<F> RevisionSource for Tampered<F>
    where
        F: Fn(Vec<Document>) -> Vec<Document> + Send + Sync,
    {
        async fn open_snapshot(&self, c: &str, ttl: Duration) -> Result<SnapshotHandle> {
            self.inner.open_snapshot(c, ttl).await
        }
        async fn close_snapshot(&self, s: &SnapshotHandle) -> Result<()> {
            self.inner.close_snapshot(s).await
        }
        async fn revision_tree(&self, s: &SnapshotHandle) -> Result<RevisionTree> {
            self.inner.revision_tree(s).await
        }
        async fn revisions_by_ranges(
            &self,
            s: &SnapshotHandle,
            r: &[RevisionRange],
            c: ResumeCursor,
        ) -> Result<RevisionPage> {
            self.inner.revisions_by_ranges(s, r, c).await
        }
        async fn revision_documents(&self, s: &SnapshotHandle, revs: &[RevisionId]) -> Result<Vec<Document>> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::Transient("flaky".into()));
            }
            let docs = self.inner.revision_documents(s, revs).await?;
            Ok((self.tamper)(docs))
        }
    }

    #[tokio::test]
    async fn test_fetch_in_chunks_aligned() {
        let (source, snapshot, revs) = local(250).await;
        let config = SyncConfig::default().with_fetch_batch_size(64);
        let fetcher = DocumentFetcher::new(source, snapshot, &config);

        let mut wanted = revs.clone();
        wanted.reverse();
        let docs = fetcher.fetch(&wanted).await.unwrap();
        assert_eq!(docs.len(), wanted.len());
        for (doc, rev) in docs.iter().zip(&wanted) {
            assert_eq!(doc.rev, *rev);
        }
    }

    #[tokio::test]
    async fn test_unknown_revision_fails_whole_fetch() {
        let (source, snapshot, revs) = local(10).await;
        let fetcher = DocumentFetcher::new(source, snapshot, &SyncConfig::default());
        let bogus = RevisionId(revs[9].0 + 100);
        let err = fetcher.fetch(&[revs[0], bogus]).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownRevision(r) if r == bogus));
    }

    #[tokio::test]
    async fn test_expired_snapshot() {
        let (source, snapshot, revs) = local(10).await;
        source.close_snapshot(&snapshot).await.unwrap();
        let fetcher = DocumentFetcher::new(source, snapshot, &SyncConfig::default());
        let err = fetcher.fetch(&revs).await.unwrap_err();
        assert!(matches!(err, SyncError::SnapshotNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried() {
        let (inner, snapshot, revs) = local(10).await;
        let source = Tampered {
            inner,
            failures: AtomicUsize::new(3),
            tamper: |docs: Vec<Document>| docs,
        };
        let fetcher = DocumentFetcher::new(source, snapshot, &SyncConfig::default());
        let docs = fetcher.fetch(&revs).await.unwrap();
        assert_eq!(docs.len(), 10);
    }

    #[tokio::test]
    async fn test_misaligned_response_rejected() {
        let (inner, snapshot, revs) = local(10).await;
        let source = Tampered {
            inner,
            failures: AtomicUsize::new(0),
            tamper: |mut docs: Vec<Document>| {
                docs.reverse();
                docs
            },
        };
        let fetcher = DocumentFetcher::new(source, snapshot, &SyncConfig::default());
        let err = fetcher.fetch(&revs[..3]).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_short_response_rejected() {
        let (inner, snapshot, revs) = local(10).await;
        let source = Tampered {
            inner,
            failures: AtomicUsize::new(0),
            tamper: |mut docs: Vec<Document>| {
                docs.pop();
                docs
            },
        };
        let fetcher = DocumentFetcher::new(source, snapshot, &SyncConfig::default());
        let err = fetcher.fetch(&revs).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_empty_fetch_skips_source() {
        let (source, _, _) = local(1).await;
        let gone = SnapshotHandle::new(SnapshotId(999), "c");
        let fetcher = DocumentFetcher::new(source, gone, &SyncConfig::default());
        assert!(fetcher.fetch(&[]).await.unwrap().is_empty());
    }
}
