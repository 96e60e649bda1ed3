//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.
//!
//! Snapshots are sequence numbers. Every write transaction bumps a write
//! sequence; a row is visible to a snapshot taken at sequence `s` when
//! `created_seq <= s` and it was not deleted at or before `s`. Deleted rows
//! are kept only while some lease can still see them.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::debug;

use revtree_core::{
    body_from_canonical, document_digest_from_canonical, Digest, Document, ResumeCursor,
    RevisionClock, RevisionId, RevisionRange, SnapshotHandle, Value,
};

use crate::error::{Result, StoreError};
use crate::lease::LeaseTable;
use crate::migration;
use crate::traits::{page_start, CollectionOptions, SnapshotStats, Store};

const SIGN_BIT: u64 = 1 << 63;

/// Map a revision onto an `i64` with the same ordering.
fn rev_to_sql(rev: RevisionId) -> i64 {
    (rev.0 ^ SIGN_BIT) as i64
}

fn rev_from_sql(value: i64) -> RevisionId {
    RevisionId(value as u64 ^ SIGN_BIT)
}

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    inner: Arc<Mutex<SqliteInner>>,
    clock: Arc<RevisionClock>,
}

struct SqliteInner {
    conn: Connection,
    /// Sequence of the last committed write.
    write_seq: i64,
    snapshots: LeaseTable<SnapshotView>,
}

struct SnapshotView {
    collection: String,
    seq: i64,
}

/// A live row located by key or revision.
struct LiveRow {
    id: i64,
    rev: RevisionId,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migration::migrate(&mut conn)?;

        // no lease survives a restart, so nothing can still see dead rows
        let purged = conn.execute("DELETE FROM documents WHERE deleted_seq IS NOT NULL", [])?;
        let write_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(created_seq), 0) FROM documents",
            [],
            |row| row.get(0),
        )?;
        let last_rev: Option<i64> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'last_rev'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        debug!(purged, write_seq, "opened sqlite store");

        let clock = last_rev
            .map(|v| RevisionClock::resume_after(rev_from_sql(v)))
            .unwrap_or_default();
        Ok(Self {
            inner: Arc::new(Mutex::new(SqliteInner {
                conn,
                write_seq,
                snapshots: LeaseTable::new(),
            })),
            clock: Arc::new(clock),
        })
    }

    /// Run a blocking operation on the connection.
    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteInner, &RevisionClock) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let clock = Arc::clone(&self.clock);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
            f(&mut guard, &clock)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

impl SqliteInner {
    /// Snapshot sequence for a handle, checking the lease.
    fn view(&self, handle: &SnapshotHandle) -> Result<i64> {
        let view = self.snapshots.get(handle.id)?;
        if view.collection != handle.collection {
            return Err(StoreError::SnapshotNotFound(handle.id));
        }
        Ok(view.seq)
    }

    /// Apply `f` in one transaction stamped with the next write sequence.
    fn write<T>(
        &mut self,
        collection: &str,
        f: impl FnOnce(&Transaction<'_>, i64, bool) -> Result<T>,
    ) -> Result<T> {
        let seq = self.write_seq + 1;
        let retain_dead = !self.snapshots.is_empty();
        let tx = self.conn.transaction()?;
        require_collection(&tx, collection)?;
        let out = f(&tx, seq, retain_dead)?;
        tx.commit()?;
        self.write_seq = seq;
        Ok(out)
    }

    /// Drop dead rows no remaining lease can see.
    fn purge_dead(&mut self) -> Result<usize> {
        let oldest = self.snapshots.values().map(|v| v.seq).min();
        let purged = match oldest {
            Some(seq) => self.conn.execute(
                "DELETE FROM documents WHERE deleted_seq IS NOT NULL AND deleted_seq <= ?1",
                params![seq],
            )?,
            None => self
                .conn
                .execute("DELETE FROM documents WHERE deleted_seq IS NOT NULL", [])?,
        };
        Ok(purged)
    }
}

fn require_collection(conn: &Connection, name: &str) -> Result<CollectionOptions> {
    let revision_tree: Option<bool> = conn
        .query_row(
            "SELECT revision_tree FROM collections WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    revision_tree
        .map(|revision_tree| CollectionOptions { revision_tree })
        .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
}

fn live_by_key(conn: &Connection, collection: &str, key: &str) -> Result<Option<LiveRow>> {
    Ok(conn
        .prepare_cached(
            "SELECT id, rev FROM documents
             WHERE collection = ?1 AND doc_key = ?2 AND deleted_seq IS NULL",
        )?
        .query_row(params![collection, key], |row| {
            Ok(LiveRow {
                id: row.get(0)?,
                rev: rev_from_sql(row.get(1)?),
            })
        })
        .optional()?)
}

fn live_by_rev(conn: &Connection, collection: &str, rev: RevisionId) -> Result<Option<LiveRow>> {
    Ok(conn
        .prepare_cached(
            "SELECT id, rev FROM documents
             WHERE collection = ?1 AND rev = ?2 AND deleted_seq IS NULL",
        )?
        .query_row(params![collection, rev_to_sql(rev)], |row| {
            Ok(LiveRow {
                id: row.get(0)?,
                rev: rev_from_sql(row.get(1)?),
            })
        })
        .optional()?)
}

/// End a row's life at `seq`.
fn bury(conn: &Connection, row: &LiveRow, seq: i64, retain_dead: bool) -> Result<()> {
    if retain_dead {
        conn.execute(
            "UPDATE documents SET deleted_seq = ?2 WHERE id = ?1",
            params![row.id, seq],
        )?;
    } else {
        conn.execute("DELETE FROM documents WHERE id = ?1", params![row.id])?;
    }
    Ok(())
}

fn insert_row(conn: &Connection, collection: &str, doc: &Document, seq: i64) -> Result<()> {
    let body = doc.canonical_body()?;
    let digest = document_digest_from_canonical(doc.rev, &doc.key, &body);
    conn.prepare_cached(
        "INSERT INTO documents (collection, rev, doc_key, body, digest, created_seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        collection,
        rev_to_sql(doc.rev),
        doc.key,
        body,
        digest.as_bytes().as_slice(),
        seq
    ])?;
    Ok(())
}

fn record_last_rev(conn: &Connection, clock: &RevisionClock) -> Result<()> {
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES ('last_rev', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![rev_to_sql(clock.last())],
    )?;
    Ok(())
}

fn row_to_document(rev: RevisionId, key: String, body: Vec<u8>) -> Result<Document> {
    let body = body_from_canonical(&body)
        .map_err(|e| StoreError::Serialization(format!("revision {rev}: {e}")))?;
    Ok(Document::new(key, rev, body)?)
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<()> {
        let name = name.to_string();
        self.call(move |inner, _| {
            if require_collection(&inner.conn, &name).is_ok() {
                return Err(StoreError::CollectionExists(name));
            }
            inner.conn.execute(
                "INSERT INTO collections (name, revision_tree, created_at) VALUES (?1, ?2, ?3)",
                params![name, options.revision_tree, migration::now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn collection_options(&self, name: &str) -> Result<CollectionOptions> {
        let name = name.to_string();
        self.call(move |inner, _| require_collection(&inner.conn, &name))
            .await
    }

    async fn insert_documents(
        &self,
        collection: &str,
        documents: &[(String, Value)],
    ) -> Result<Vec<RevisionId>> {
        let collection = collection.to_string();
        let documents = documents.to_vec();
        self.call(move |inner, clock| {
            inner.write(&collection, |tx, seq, _| {
                let mut seen = HashSet::new();
                for (key, _) in &documents {
                    if !seen.insert(key.as_str()) || live_by_key(tx, &collection, key)?.is_some() {
                        return Err(StoreError::DocumentExists {
                            collection: collection.clone(),
                            key: key.clone(),
                        });
                    }
                }
                let mut revs = Vec::with_capacity(documents.len());
                for (key, body) in &documents {
                    let doc = Document::new(key.clone(), clock.next()?, body.clone())?;
                    insert_row(tx, &collection, &doc, seq)?;
                    revs.push(doc.rev);
                }
                record_last_rev(tx, clock)?;
                Ok(revs)
            })
        })
        .await
    }

    async fn update_document(
        &self,
        collection: &str,
        key: &str,
        body: &Value,
    ) -> Result<RevisionId> {
        let collection = collection.to_string();
        let key = key.to_string();
        let body = body.clone();
        self.call(move |inner, clock| {
            inner.write(&collection, |tx, seq, retain_dead| {
                let old = live_by_key(tx, &collection, &key)?.ok_or_else(|| {
                    StoreError::DocumentNotFound {
                        collection: collection.clone(),
                        key: key.clone(),
                    }
                })?;
                let doc = Document::new(key.clone(), clock.next()?, body)?;
                bury(tx, &old, seq, retain_dead)?;
                insert_row(tx, &collection, &doc, seq)?;
                record_last_rev(tx, clock)?;
                Ok(doc.rev)
            })
        })
        .await
    }

    async fn remove_document(&self, collection: &str, key: &str) -> Result<RevisionId> {
        let collection = collection.to_string();
        let key = key.to_string();
        self.call(move |inner, _| {
            inner.write(&collection, |tx, seq, retain_dead| {
                let row = live_by_key(tx, &collection, &key)?.ok_or_else(|| {
                    StoreError::DocumentNotFound {
                        collection: collection.clone(),
                        key: key.clone(),
                    }
                })?;
                bury(tx, &row, seq, retain_dead)?;
                Ok(row.rev)
            })
        })
        .await
    }

    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Document>> {
        let collection = collection.to_string();
        let key = key.to_string();
        self.call(move |inner, _| {
            require_collection(&inner.conn, &collection)?;
            let row: Option<(i64, Vec<u8>)> = inner
                .conn
                .query_row(
                    "SELECT rev, body FROM documents
                     WHERE collection = ?1 AND doc_key = ?2 AND deleted_seq IS NULL",
                    params![collection, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            row.map(|(rev, body)| row_to_document(rev_from_sql(rev), key, body))
                .transpose()
        })
        .await
    }

    async fn apply_document(
        &self,
        collection: &str,
        document: &Document,
    ) -> Result<Option<RevisionId>> {
        document.validate()?;
        let collection = collection.to_string();
        let doc = document.clone();
        self.call(move |inner, clock| {
            inner.write(&collection, |tx, seq, retain_dead| {
                if live_by_rev(tx, &collection, doc.rev)?.is_some() {
                    return Ok(None);
                }
                let replaced = live_by_key(tx, &collection, &doc.key)?;
                if let Some(old) = &replaced {
                    bury(tx, old, seq, retain_dead)?;
                }
                insert_row(tx, &collection, &doc, seq)?;
                clock.observe(doc.rev);
                record_last_rev(tx, clock)?;
                Ok(replaced.map(|row| row.rev))
            })
        })
        .await
    }

    async fn remove_revision(&self, collection: &str, rev: RevisionId) -> Result<bool> {
        let collection = collection.to_string();
        self.call(move |inner, _| {
            inner.write(&collection, |tx, seq, retain_dead| {
                match live_by_rev(tx, &collection, rev)? {
                    Some(row) => {
                        bury(tx, &row, seq, retain_dead)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
        })
        .await
    }

    async fn document_count(&self, collection: &str) -> Result<u64> {
        let collection = collection.to_string();
        self.call(move |inner, _| {
            require_collection(&inner.conn, &collection)?;
            let count: i64 = inner.conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1 AND deleted_seq IS NULL",
                params![collection],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn create_snapshot(&self, collection: &str, ttl: Duration) -> Result<SnapshotHandle> {
        let collection = collection.to_string();
        self.call(move |inner, _| {
            require_collection(&inner.conn, &collection)?;
            let seq = inner.write_seq;
            let id = inner.snapshots.insert(
                SnapshotView {
                    collection: collection.clone(),
                    seq,
                },
                ttl,
            );
            debug!(%id, %collection, seq, "created snapshot");
            Ok(SnapshotHandle::new(id, collection))
        })
        .await
    }

    async fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<()> {
        let id = handle.id;
        self.call(move |inner, _| {
            inner.snapshots.remove(id)?;
            let purged = inner.purge_dead()?;
            debug!(%id, purged, "deleted snapshot");
            Ok(())
        })
        .await
    }

    async fn snapshot_stats(&self, handle: &SnapshotHandle) -> Result<SnapshotStats> {
        let handle = handle.clone();
        self.call(move |inner, _| {
            let seq = inner.view(&handle)?;
            let (count, min, max): (i64, Option<i64>, Option<i64>) = inner.conn.query_row(
                "SELECT COUNT(*), MIN(rev), MAX(rev) FROM documents
                 WHERE collection = ?1 AND created_seq <= ?2
                   AND (deleted_seq IS NULL OR deleted_seq > ?2)",
                params![handle.collection, seq],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(SnapshotStats {
                count: count as u64,
                min_rev: min.map(rev_from_sql),
                max_rev: max.map(rev_from_sql),
            })
        })
        .await
    }

    async fn snapshot_digests(
        &self,
        handle: &SnapshotHandle,
        range: RevisionRange,
    ) -> Result<Vec<(RevisionId, Digest)>> {
        range.validate()?;
        let handle = handle.clone();
        self.call(move |inner, _| {
            let seq = inner.view(&handle)?;
            let mut stmt = inner.conn.prepare_cached(
                "SELECT rev, digest FROM documents
                 WHERE collection = ?1 AND created_seq <= ?2
                   AND (deleted_seq IS NULL OR deleted_seq > ?2)
                   AND rev BETWEEN ?3 AND ?4
                 ORDER BY rev",
            )?;
            let rows = stmt.query_map(
                params![
                    handle.collection,
                    seq,
                    rev_to_sql(range.min),
                    rev_to_sql(range.max)
                ],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )?;
            let mut out = Vec::new();
            for row in rows {
                let (rev, digest) = row?;
                let digest = Digest::try_from(digest.as_slice())
                    .map_err(|_| StoreError::InvalidData(format!("bad digest at rev {rev}")))?;
                out.push((rev_from_sql(rev), digest));
            }
            Ok(out)
        })
        .await
    }

    async fn snapshot_revisions(
        &self,
        handle: &SnapshotHandle,
        range: RevisionRange,
        after: ResumeCursor,
        limit: usize,
    ) -> Result<Vec<RevisionId>> {
        range.validate()?;
        let handle = handle.clone();
        self.call(move |inner, _| {
            let seq = inner.view(&handle)?;
            let Some(start) = page_start(range, after) else {
                return Ok(Vec::new());
            };
            let mut stmt = inner.conn.prepare_cached(
                "SELECT rev FROM documents
                 WHERE collection = ?1 AND created_seq <= ?2
                   AND (deleted_seq IS NULL OR deleted_seq > ?2)
                   AND rev BETWEEN ?3 AND ?4
                 ORDER BY rev
                 LIMIT ?5",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let revs = stmt
                .query_map(
                    params![
                        handle.collection,
                        seq,
                        rev_to_sql(start),
                        rev_to_sql(range.max),
                        limit
                    ],
                    |row| row.get::<_, i64>(0),
                )?
                .map(|r| r.map(rev_from_sql))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(revs)
        })
        .await
    }

    async fn snapshot_documents(
        &self,
        handle: &SnapshotHandle,
        revs: &[RevisionId],
    ) -> Result<Vec<Option<Document>>> {
        let handle = handle.clone();
        let revs = revs.to_vec();
        self.call(move |inner, _| {
            let seq = inner.view(&handle)?;
            let mut stmt = inner.conn.prepare_cached(
                "SELECT doc_key, body FROM documents
                 WHERE collection = ?1 AND rev = ?3 AND created_seq <= ?2
                   AND (deleted_seq IS NULL OR deleted_seq > ?2)",
            )?;
            let mut out = Vec::with_capacity(revs.len());
            for rev in revs {
                let row: Option<(String, Vec<u8>)> = stmt
                    .query_row(params![handle.collection, seq, rev_to_sql(rev)], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .optional()?;
                out.push(
                    row.map(|(key, body)| row_to_document(rev, key, body))
                        .transpose()?,
                );
            }
            Ok(out)
        })
        .await
    }
}
