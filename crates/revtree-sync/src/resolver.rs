//! Paged resolution of revision ranges against a source.

use std::time::Duration;

use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use revtree_core::{validate_ranges, ResumeCursor, RevisionRange, Revisions, SnapshotHandle};

use crate::error::{Result, SyncError};
use crate::messages::RevisionPage;
use crate::protocol::SyncConfig;
use crate::source::RevisionSource;

/// Walks a set of ranges page by page, holding the resume cursor.
///
/// Each call to [`RangeResolver::next_page`] has its own deadline, while
/// [`RangeResolver::resolve_all`] holds one deadline across every page it
/// drives. Within a deadline, transient failures and pages the source is not
/// ready to serve yet are retried with exponential back-off.
pub struct RangeResolver<R> {
    source: R,
    snapshot: SnapshotHandle,
    ranges: Vec<RevisionRange>,
    cursor: ResumeCursor,
    done: bool,
    timeout: Duration,
    poll_interval: Duration,
    max_poll_interval: Duration,
    cancel: CancellationToken,
}

impl<R: RevisionSource> RangeResolver<R> {
    /// Ranges must be ascending and disjoint.
    pub fn new(
        source: R,
        snapshot: SnapshotHandle,
        ranges: Vec<RevisionRange>,
        config: &SyncConfig,
    ) -> Result<Self> {
        validate_ranges(&ranges)?;
        Ok(Self {
            source,
            snapshot,
            ranges,
            cursor: ResumeCursor::Start,
            done: false,
            timeout: config.resolve_timeout,
            poll_interval: config.poll_interval,
            max_poll_interval: config.max_poll_interval.max(config.poll_interval),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Continue from a cursor returned by an earlier resolver.
    pub fn resume_from(mut self, cursor: ResumeCursor) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn cursor(&self) -> ResumeCursor {
        self.cursor
    }

    pub fn ranges(&self) -> &[RevisionRange] {
        &self.ranges
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch the next page, or `None` once the terminal page has been seen.
    pub async fn next_page(&mut self) -> Result<Option<RevisionPage>> {
        self.page_before(Instant::now() + self.timeout).await
    }

    async fn page_before(&mut self, deadline: Instant) -> Result<Option<RevisionPage>> {
        if self.done {
            return Ok(None);
        }
        if self.ranges.is_empty() {
            self.done = true;
            return Ok(None);
        }

        let mut delay = self.poll_interval;
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            attempts += 1;

            let call = self
                .source
                .revisions_by_ranges(&self.snapshot, &self.ranges, self.cursor);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                outcome = timeout_at(deadline, call) => outcome,
            };

            match outcome {
                Err(_) => return Err(self.timed_out(attempts)),
                Ok(Ok(page)) => {
                    self.check_page(&page)?;
                    let stalled = page.is_empty() && page.next == Some(self.cursor);
                    if !stalled {
                        match page.next {
                            Some(next) => self.cursor = next,
                            None => self.done = true,
                        }
                        return Ok(Some(page));
                    }
                    debug!(snapshot = %self.snapshot, attempts, "revision page not ready");
                }
                Ok(Err(SyncError::Transient(reason))) => {
                    warn!(snapshot = %self.snapshot, attempts, %reason, "transient resolve failure");
                }
                Ok(Err(e)) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(attempts));
            }
            let wake = deadline.min(now + delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = sleep_until(wake) => {}
            }
            delay = (delay * 2).min(self.max_poll_interval);
        }
    }

    /// Drive pages to the end and concatenate them per range, all within one
    /// resolve timeout.
    pub async fn resolve_all(&mut self) -> Result<Vec<Revisions>> {
        let deadline = Instant::now() + self.timeout;
        let mut out = vec![Vec::new(); self.ranges.len()];
        while let Some(page) = self.page_before(deadline).await? {
            for (acc, revs) in out.iter_mut().zip(page.ranges) {
                acc.extend(revs);
            }
        }
        Ok(out)
    }

    fn timed_out(&self, attempts: u32) -> SyncError {
        SyncError::Timeout(format!(
            "resolving {} ranges of {} after {attempts} attempts",
            self.ranges.len(),
            self.snapshot
        ))
    }

    fn check_page(&self, page: &RevisionPage) -> Result<()> {
        if page.ranges.len() != self.ranges.len() {
            return Err(SyncError::InvalidMessage(format!(
                "page has {} ranges, expected {}",
                page.ranges.len(),
                self.ranges.len()
            )));
        }

        let mut floor = self.cursor;
        for (range, revs) in self.ranges.iter().zip(&page.ranges) {
            for &rev in revs {
                if !range.contains(rev) {
                    return Err(SyncError::InvalidMessage(format!(
                        "revision {rev} outside range {range}"
                    )));
                }
                if !floor.admits(rev) {
                    return Err(SyncError::InvalidMessage(format!(
                        "revision {rev} out of order"
                    )));
                }
                floor = ResumeCursor::After(rev);
            }
        }

        if let Some(next) = page.next {
            // the cursor may not step back over anything already handed out
            if next.to_wire() < floor.to_wire() {
                return Err(SyncError::InvalidMessage(format!(
                    "resume cursor {} behind last revision {}",
                    next.to_wire(),
                    floor.to_wire()
                )));
            }
        }
        Ok(())
    }
}
