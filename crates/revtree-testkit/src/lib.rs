//! # revtree testkit
//!
//! Testing utilities for revtree.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: Pinned token encodings and tree shapes
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: Populated stores, typed records, tracing setup
//! - **Faults**: Revision sources that stall or fail on purpose
//!
//! ## Golden Vectors
//!
//! ```rust
//! use revtree_testkit::vectors::verify_all_vectors;
//!
//! for (name, passed, detail) in verify_all_vectors() {
//!     assert!(passed, "{name}: {detail}");
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use revtree_core::{build_tree, TreeOptions};
//! use revtree_testkit::generators::leaf_entries;
//!
//! proptest! {
//!     #[test]
//!     fn tree_counts_every_entry(entries in leaf_entries(500)) {
//!         let tree = build_tree(&TreeOptions::default(), &entries).unwrap();
//!         prop_assert_eq!(tree.count(), entries.len() as u64);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use revtree_testkit::fixtures::TestFixture;
//!
//! # async fn example() -> revtree_store::Result<()> {
//! let (leader, revs) = TestFixture::with_users(1_000).await?;
//! let follower = leader.mirror().await?;
//! assert_eq!(follower.count().await?, revs.len() as u64);
//! # Ok(())
//! # }
//! ```

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use faults::{FlakySource, StallingSource};
pub use fixtures::{init_tracing, user, users, TestFixture, UserDoc, USERS};
pub use generators::{leaf_entries, tree_options, Mutation};
pub use vectors::{shape_vectors, token_vectors, verify_all_vectors};
