//! # Revtree Store
//!
//! Storage abstraction for revtree. Provides a trait-based interface for
//! document persistence and snapshot leases, with SQLite and in-memory
//! implementations.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`CollectionOptions`] - Per-collection settings
//! - [`SnapshotStats`] - Count and bounds of a snapshot's live revisions
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use revtree_store::{CollectionOptions, SqliteStore, Store, StoreExt};
//!
//! async fn example() -> revtree_store::Result<()> {
//!     let store = SqliteStore::open("revtree.db")?;
//!     store.create_collection("users", CollectionOptions::default()).await?;
//!
//!     let body = revtree_core::Value::Map(vec![("age".into(), 42.into())]);
//!     store.insert_document("users", "u1", body).await?;
//!
//!     let snapshot = store.create_snapshot("users", Duration::from_secs(3600)).await?;
//!     let stats = store.snapshot_stats(&snapshot).await?;
//!     println!("{} live revisions", stats.count);
//!     store.delete_snapshot(&snapshot).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Local writes** take a fresh revision from the store's clock
//! - **Replicated writes** keep the revision they arrived with
//! - **Snapshots** are isolated from later writes until their lease is deleted

pub mod error;
pub mod lease;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use lease::LeaseTable;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{CollectionOptions, SnapshotStats, Store, StoreExt};
