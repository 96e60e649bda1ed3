//! Building revision trees from (revision, digest) pairs.
//!
//! A build fills the leaf level and then derives every internal node from
//! it. Leaves can be filled in independent [`LeafBatch`]es, one per subtree,
//! and merged afterwards; the result is identical to a sequential build.

use std::ops::Range;

use crate::digest::Digest;
use crate::error::{CoreError, Result};
use crate::tree::{RevisionNode, RevisionTree, TreeGeometry, TreeOptions};
use crate::types::{RevisionId, RevisionRange};

/// Leaves of one contiguous slice of a tree.
#[derive(Debug, Clone)]
pub struct LeafBatch {
    geometry: TreeGeometry,
    first_leaf: u64,
    leaves: Vec<RevisionNode>,
}

impl LeafBatch {
    /// An empty batch covering `leaves` of `geometry`.
    pub fn new(geometry: TreeGeometry, leaves: Range<u64>) -> Self {
        let len = leaves.end.saturating_sub(leaves.start) as usize;
        Self {
            geometry,
            first_leaf: leaves.start,
            leaves: vec![RevisionNode::EMPTY; len],
        }
    }

    /// Revisions the batch accepts.
    pub fn revisions(&self) -> RevisionRange {
        let last = self.first_leaf + self.leaves.len() as u64 - 1;
        RevisionRange {
            min: self.geometry.leaf_range(self.first_leaf).min,
            max: self.geometry.leaf_range(last).max,
        }
    }

    /// Fold one document into its leaf.
    pub fn add(&mut self, rev: RevisionId, digest: &Digest) -> Result<()> {
        let leaf = self.geometry.leaf_index(rev)?;
        let end = self.first_leaf + self.leaves.len() as u64;
        if leaf < self.first_leaf || leaf >= end {
            let covered = self.revisions();
            return Err(CoreError::OutOfBounds {
                rev,
                min: covered.min,
                max: covered.max,
            });
        }
        self.leaves[(leaf - self.first_leaf) as usize].add(digest);
        Ok(())
    }

    /// Documents folded in so far.
    pub fn count(&self) -> u64 {
        self.leaves.iter().map(|l| l.count).sum()
    }
}

/// Accumulates a whole tree.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    geometry: TreeGeometry,
    leaves: Vec<RevisionNode>,
}

impl TreeBuilder {
    pub fn new(geometry: TreeGeometry) -> Self {
        Self {
            geometry,
            leaves: vec![RevisionNode::EMPTY; geometry.leaf_count() as usize],
        }
    }

    pub fn geometry(&self) -> &TreeGeometry {
        &self.geometry
    }

    /// Fold one document into the tree.
    pub fn add(&mut self, rev: RevisionId, digest: &Digest) -> Result<()> {
        let leaf = self.geometry.leaf_index(rev)?;
        self.leaves[leaf as usize].add(digest);
        Ok(())
    }

    /// Merge a batch built separately against the same geometry.
    pub fn absorb(&mut self, batch: LeafBatch) -> Result<()> {
        if batch.geometry != self.geometry {
            return Err(CoreError::VersionMismatch {
                local: self.geometry,
                remote: batch.geometry,
            });
        }
        let start = batch.first_leaf as usize;
        let slots = self
            .leaves
            .get_mut(start..start + batch.leaves.len())
            .ok_or_else(|| CoreError::MalformedTree("batch outside the leaf level".into()))?;
        for (slot, leaf) in slots.iter_mut().zip(&batch.leaves) {
            slot.absorb(leaf);
        }
        Ok(())
    }

    /// Derive internal nodes and return the finished tree.
    pub fn finish(self) -> RevisionTree {
        let mut tree = RevisionTree::empty(self.geometry);
        let first_leaf = self.geometry.first_leaf_offset();
        tree.nodes[first_leaf..].copy_from_slice(&self.leaves);
        tree.recompute_internal();
        tree
    }
}

/// Build a tree sized for `entries`.
///
/// Entries need not be sorted.
pub fn build_tree(options: &TreeOptions, entries: &[(RevisionId, Digest)]) -> Result<RevisionTree> {
    let bounds = entries.iter().fold(None, |acc: Option<(RevisionId, RevisionId)>, (rev, _)| {
        Some(match acc {
            None => (*rev, *rev),
            Some((lo, hi)) => (lo.min(*rev), hi.max(*rev)),
        })
    });
    let geometry = TreeGeometry::for_population(options, entries.len() as u64, bounds)?;
    build_aligned(geometry, entries.iter().map(|(rev, digest)| (*rev, *digest)))
}

/// Build a tree with a fixed geometry, typically one taken from a peer.
///
/// Every entry must fall inside the geometry's range.
pub fn build_aligned<I>(geometry: TreeGeometry, entries: I) -> Result<RevisionTree>
where
    I: IntoIterator<Item = (RevisionId, Digest)>,
{
    geometry.validate()?;
    let mut builder = TreeBuilder::new(geometry);
    for (rev, digest) in entries {
        builder.add(rev, &digest)?;
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(revs: impl IntoIterator<Item = u64>) -> Vec<(RevisionId, Digest)> {
        revs.into_iter()
            .map(|r| (RevisionId(r), Digest::hash(&r.to_be_bytes())))
            .collect()
    }

    #[test]
    fn test_build_matches_incremental_inserts() {
        let items = entries(1..=500);
        let built = build_tree(&TreeOptions::default(), &items).unwrap();

        let mut incremental = RevisionTree::empty(built.geometry());
        for (rev, digest) in items.iter().rev() {
            incremental.insert(*rev, digest).unwrap();
        }
        assert_eq!(built, incremental);
        assert_eq!(built.count(), 500);
        built.validate().unwrap();
    }

    #[test]
    fn test_build_is_order_independent() {
        let mut items = entries((10..400).step_by(3));
        let a = build_tree(&TreeOptions::default(), &items).unwrap();
        items.reverse();
        let b = build_tree(&TreeOptions::default(), &items).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_batches_equal_sequential_build() {
        let items = entries(1..=3_000);
        let sequential = build_tree(&TreeOptions::default(), &items).unwrap();
        let geometry = sequential.geometry();

        let mut builder = TreeBuilder::new(geometry);
        for span in geometry.top_level_spans() {
            let mut batch = LeafBatch::new(geometry, span);
            let covered = batch.revisions();
            for (rev, digest) in items.iter().filter(|(r, _)| covered.contains(*r)) {
                batch.add(*rev, digest).unwrap();
            }
            builder.absorb(batch).unwrap();
        }
        assert_eq!(builder.finish(), sequential);
    }

    #[test]
    fn test_batch_rejects_foreign_revision() {
        let geometry = TreeGeometry::new(RevisionId(1), RevisionId(65), 2, 8).unwrap();
        let mut batch = LeafBatch::new(geometry, 0..8);
        assert!(batch.add(RevisionId(8), &Digest::ZERO).is_ok());
        assert!(batch.add(RevisionId(9), &Digest::ZERO).is_err());
        assert_eq!(batch.count(), 1);
    }

    #[test]
    fn test_aligned_rejects_outlier() {
        let geometry = TreeGeometry::new(RevisionId(1), RevisionId(9), 1, 8).unwrap();
        assert!(build_aligned(geometry, entries([3, 8])).is_ok());
        assert!(build_aligned(geometry, entries([3, 9])).is_err());
    }

    #[test]
    fn test_empty_build() {
        let tree = build_tree(&TreeOptions::default(), &[]).unwrap();
        assert_eq!(tree.count(), 0);
        assert!(tree.root_hash().is_zero());
        assert_eq!(tree.nodes.len(), 9);
    }
}
