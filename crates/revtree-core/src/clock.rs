//! Revision clock: hands out strictly increasing revision ids.
//!
//! Revisions are hybrid logical timestamps: wall-clock milliseconds in the
//! upper bits, a counter in the lower 20 bits. A clock never goes backwards,
//! even if the wall clock does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CoreError, Result};
use crate::types::RevisionId;

/// Bits reserved for the logical counter.
pub const COUNTER_BITS: u32 = 20;

/// A monotonic revision source.
#[derive(Debug, Default)]
pub struct RevisionClock {
    last: AtomicU64,
}

impl RevisionClock {
    /// A clock that has issued nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that will only issue revisions greater than `last`.
    pub fn resume_after(last: RevisionId) -> Self {
        Self {
            last: AtomicU64::new(last.0),
        }
    }

    /// The most recently issued (or observed) revision.
    pub fn last(&self) -> RevisionId {
        RevisionId(self.last.load(Ordering::Acquire))
    }

    /// Issue the next revision, never past [`RevisionId::LAST`].
    pub fn next(&self) -> Result<RevisionId> {
        let physical = physical_now().min(RevisionId::LAST.0);
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            if current >= RevisionId::LAST.0 {
                return Err(CoreError::ClockExhausted(RevisionId(current)));
            }
            let candidate = physical.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(RevisionId(candidate)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a revision issued elsewhere so later local revisions sort after it.
    pub fn observe(&self, rev: RevisionId) {
        self.last.fetch_max(rev.0, Ordering::AcqRel);
    }
}

fn physical_now() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    millis << COUNTER_BITS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_strictly_increasing() {
        let clock = RevisionClock::new();
        let mut prev = RevisionId::ZERO;
        for _ in 0..10_000 {
            let rev = clock.next().unwrap();
            assert!(rev > prev);
            prev = rev;
        }
    }

    #[test]
    fn test_clock_observe_moves_forward() {
        let clock = RevisionClock::new();
        let far = RevisionId(u64::MAX / 2);
        clock.observe(far);
        assert!(clock.next().unwrap() > far);
        clock.observe(RevisionId(1));
        assert!(clock.last() > far);
    }

    #[test]
    fn test_clock_stops_short_of_max() {
        let clock = RevisionClock::resume_after(RevisionId(u64::MAX - 2));
        assert_eq!(clock.next().unwrap(), RevisionId::LAST);
        assert!(matches!(clock.next(), Err(CoreError::ClockExhausted(_))));
        assert_eq!(clock.last(), RevisionId::LAST);

        let clock = RevisionClock::resume_after(RevisionId::MAX);
        assert!(clock.next().is_err());
    }
}
