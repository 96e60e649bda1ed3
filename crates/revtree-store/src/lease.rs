//! Snapshot leases: time-bounded handles on a consistent read view.
//!
//! A lease is owned by whoever created it. Reads through an expired lease
//! fail with `SnapshotExpired` until the owner deletes it; after deletion the
//! id is unknown and reads fail with `SnapshotNotFound`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use revtree_core::SnapshotId;

use crate::error::{Result, StoreError};

/// Expired leases nobody deleted are dropped after this long.
pub const EXPIRED_RETENTION: Duration = Duration::from_secs(600);

/// Longer TTLs are cut to this, so huge ones never wrap the clock.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug)]
struct Lease<T> {
    value: T,
    expires_at: Instant,
}

/// Leases keyed by snapshot id.
#[derive(Debug)]
pub struct LeaseTable<T> {
    next_id: u64,
    leases: HashMap<SnapshotId, Lease<T>>,
}

impl<T> Default for LeaseTable<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            leases: HashMap::new(),
        }
    }
}

impl<T> LeaseTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lease valid for `ttl`, at most [`MAX_TTL`].
    pub fn insert(&mut self, value: T, ttl: Duration) -> SnapshotId {
        self.purge_abandoned();
        let id = SnapshotId(self.next_id);
        self.next_id += 1;
        let expires_at = Instant::now() + ttl.min(MAX_TTL);
        self.leases.insert(id, Lease { value, expires_at });
        id
    }

    /// Borrow a live lease.
    pub fn get(&self, id: SnapshotId) -> Result<&T> {
        let lease = self
            .leases
            .get(&id)
            .ok_or(StoreError::SnapshotNotFound(id))?;
        if Instant::now() >= lease.expires_at {
            return Err(StoreError::SnapshotExpired(id));
        }
        Ok(&lease.value)
    }

    /// Delete a lease, expired or not.
    pub fn remove(&mut self, id: SnapshotId) -> Result<T> {
        self.leases
            .remove(&id)
            .map(|lease| lease.value)
            .ok_or(StoreError::SnapshotNotFound(id))
    }

    /// Values of every lease that has not yet been deleted.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.leases.values().map(|lease| &lease.value)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    fn purge_abandoned(&mut self) {
        let now = Instant::now();
        self.leases.retain(|_, lease| {
            lease
                .expires_at
                .checked_add(EXPIRED_RETENTION)
                .map_or(true, |deadline| now < deadline)
        });
    }
}
