//! The revision tree: a dense, fixed-fanout summary of a revision range.
//!
//! Nodes live in one `Vec`, root first, level by level. Level `l` starts at
//! offset `(b^l - 1) / (b - 1)`; the children of node `i` are
//! `i*b + 1 ..= i*b + b` and its parent is `(i - 1) / b`. No pointers, no
//! per-node allocation.
//!
//! The tree covers the half-open interval `[range_min, range_max)`, split
//! into `b^max_depth` leaves of equal integer width.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::digest::Digest;
use crate::error::{CoreError, Result};
use crate::types::{RevisionId, RevisionRange};

/// Current tree format version.
pub const TREE_FORMAT_VERSION: u32 = 1;

/// Fanout used unless configured otherwise.
pub const DEFAULT_BRANCH_FACTOR: u32 = 8;

/// Expected live revisions per leaf when choosing a depth.
pub const DEFAULT_LEAF_DENSITY: u64 = 64;

pub const DEFAULT_MIN_DEPTH: u32 = 1;
pub const DEFAULT_MAX_DEPTH: u32 = 6;

pub const MIN_BRANCH_FACTOR: u32 = 2;
pub const MAX_BRANCH_FACTOR: u32 = 16;

/// Upper bound on leaves, so a decoded tree cannot demand a huge allocation.
pub const MAX_LEAF_COUNT: u64 = 1 << 24;

fn default_branch_factor() -> u32 {
    DEFAULT_BRANCH_FACTOR
}

/// Summary of one sub-range of the revision space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RevisionNode {
    /// Combination of all document digests in the sub-range.
    pub hash: Digest,
    /// Number of documents combined.
    pub count: u64,
}

impl RevisionNode {
    pub const EMPTY: Self = Self {
        hash: Digest::ZERO,
        count: 0,
    };

    /// Fold one document into the node.
    pub fn add(&mut self, digest: &Digest) {
        self.hash.combine(digest);
        self.count += 1;
    }

    /// Take one document back out of the node.
    pub fn remove(&mut self, digest: &Digest) -> Result<()> {
        if self.count == 0 {
            return Err(CoreError::MalformedTree(
                "removing from an empty node".into(),
            ));
        }
        self.hash.remove(digest);
        self.count -= 1;
        Ok(())
    }

    /// Fold a whole child node into this one.
    pub fn absorb(&mut self, other: &RevisionNode) {
        self.hash.combine(&other.hash);
        self.count += other.count;
    }
}

/// Knobs for choosing a tree shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeOptions {
    /// Children per internal node.
    pub branch_factor: u32,
    /// Target number of live revisions per leaf.
    pub leaf_density: u64,
    /// Shallowest tree ever built.
    pub min_depth: u32,
    /// Deepest tree ever built.
    pub max_depth: u32,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            branch_factor: DEFAULT_BRANCH_FACTOR,
            leaf_density: DEFAULT_LEAF_DENSITY,
            min_depth: DEFAULT_MIN_DEPTH,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl TreeOptions {
    pub fn with_branch_factor(mut self, branch_factor: u32) -> Self {
        self.branch_factor = branch_factor;
        self
    }

    pub fn with_leaf_density(mut self, leaf_density: u64) -> Self {
        self.leaf_density = leaf_density;
        self
    }

    pub fn with_depth_bounds(mut self, min_depth: u32, max_depth: u32) -> Self {
        self.min_depth = min_depth;
        self.max_depth = max_depth;
        self
    }

    /// Check that every tree these options can produce is representable.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BRANCH_FACTOR..=MAX_BRANCH_FACTOR).contains(&self.branch_factor) {
            return Err(CoreError::MalformedTree(format!(
                "branch factor {} not in {MIN_BRANCH_FACTOR}..={MAX_BRANCH_FACTOR}",
                self.branch_factor
            )));
        }
        if self.leaf_density == 0 {
            return Err(CoreError::MalformedTree("leaf density must be positive".into()));
        }
        if self.min_depth > self.max_depth {
            return Err(CoreError::MalformedTree(format!(
                "min depth {} above max depth {}",
                self.min_depth, self.max_depth
            )));
        }
        leaf_count(self.branch_factor, self.max_depth)?;
        Ok(())
    }

    /// Shallowest depth in bounds whose leaves hold `count` revisions at the
    /// target density.
    pub fn depth_for(&self, count: u64) -> u32 {
        let b = u64::from(self.branch_factor);
        let mut depth = self.min_depth;
        let mut leaves = b.saturating_pow(depth);
        while depth < self.max_depth && leaves.saturating_mul(self.leaf_density) < count {
            depth += 1;
            leaves = leaves.saturating_mul(b);
        }
        depth
    }
}

/// `b^depth`, bounded by [`MAX_LEAF_COUNT`].
fn leaf_count(branch_factor: u32, depth: u32) -> Result<u64> {
    u64::from(branch_factor)
        .checked_pow(depth)
        .filter(|n| *n <= MAX_LEAF_COUNT)
        .ok_or_else(|| {
            CoreError::MalformedTree(format!(
                "{branch_factor}^{depth} leaves exceed the limit of {MAX_LEAF_COUNT}"
            ))
        })
}

/// Number of nodes in a dense tree: `Σ_{i=0}^{depth} b^i`.
pub fn node_count(branch_factor: u32, depth: u32) -> u64 {
    let b = u64::from(branch_factor);
    (0..=depth).map(|i| b.pow(i)).sum()
}

/// Everything that must agree for two trees to be compared node by node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeGeometry {
    pub version: u32,
    pub range_min: RevisionId,
    pub range_max: RevisionId,
    pub max_depth: u32,
    pub branch_factor: u32,
}

impl TreeGeometry {
    /// Geometry for an explicit range; `range_max - range_min` must be a
    /// positive multiple of the leaf count.
    pub fn new(
        range_min: RevisionId,
        range_max: RevisionId,
        max_depth: u32,
        branch_factor: u32,
    ) -> Result<Self> {
        let geometry = Self {
            version: TREE_FORMAT_VERSION,
            range_min,
            range_max,
            max_depth,
            branch_factor,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Choose a geometry for a snapshot with `count` live revisions spanning
    /// `[min_rev, max_rev]`.
    pub fn for_population(
        options: &TreeOptions,
        count: u64,
        bounds: Option<(RevisionId, RevisionId)>,
    ) -> Result<Self> {
        options.validate()?;
        let depth = options.depth_for(count);
        let leaves = leaf_count(options.branch_factor, depth)?;

        let (min_rev, max_rev) = match bounds {
            Some((min, max)) => {
                RevisionRange::new(min, max)?;
                (min, max)
            }
            None => (RevisionId(1), RevisionId(1)),
        };
        // documents never carry MAX; see `Document::validate`
        if max_rev == RevisionId::MAX {
            return Err(CoreError::OutOfBounds {
                rev: max_rev,
                min: min_rev,
                max: RevisionId::MAX,
            });
        }

        let span = u128::from(max_rev.0 - min_rev.0) + 1;
        let width = span.div_ceil(u128::from(leaves)).max(1);
        let total = width * u128::from(leaves);

        let (range_min, range_max) = if u128::from(min_rev.0) + total <= u128::from(u64::MAX) {
            (min_rev.0, min_rev.0 + total as u64)
        } else if total <= u128::from(u64::MAX) {
            // shift down so the top of the range lands on u64::MAX
            (u64::MAX - total as u64, u64::MAX)
        } else {
            return Err(CoreError::MalformedTree(format!(
                "revision span {min_rev}..={max_rev} too wide for {leaves} leaves"
            )));
        };

        Self::new(
            RevisionId(range_min),
            RevisionId(range_max),
            depth,
            options.branch_factor,
        )
    }

    /// Check the structural rules of a geometry.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BRANCH_FACTOR..=MAX_BRANCH_FACTOR).contains(&self.branch_factor) {
            return Err(CoreError::MalformedTree(format!(
                "branch factor {} not supported",
                self.branch_factor
            )));
        }
        let leaves = leaf_count(self.branch_factor, self.max_depth)?;
        if self.range_max <= self.range_min {
            return Err(CoreError::MalformedTree(format!(
                "empty tree range [{}, {})",
                self.range_min, self.range_max
            )));
        }
        if (self.range_max.0 - self.range_min.0) % leaves != 0 {
            return Err(CoreError::MalformedTree(format!(
                "range width {} not divisible into {leaves} leaves",
                self.range_max.0 - self.range_min.0
            )));
        }
        Ok(())
    }

    /// `b^max_depth`.
    pub fn leaf_count(&self) -> u64 {
        u64::from(self.branch_factor).pow(self.max_depth)
    }

    /// Total nodes across all levels.
    pub fn node_count(&self) -> usize {
        node_count(self.branch_factor, self.max_depth) as usize
    }

    /// Revisions per leaf.
    pub fn leaf_width(&self) -> u64 {
        (self.range_max.0 - self.range_min.0) / self.leaf_count()
    }

    /// Position of the first node of `level`.
    pub fn level_offset(&self, level: u32) -> usize {
        node_count(self.branch_factor, level) as usize - u64::from(self.branch_factor).pow(level) as usize
    }

    /// Position of the first leaf.
    pub fn first_leaf_offset(&self) -> usize {
        self.level_offset(self.max_depth)
    }

    /// The closed revision range the whole tree covers.
    pub fn covered(&self) -> RevisionRange {
        RevisionRange {
            min: self.range_min,
            max: RevisionId(self.range_max.0 - 1),
        }
    }

    /// Whether a revision falls inside the tree.
    pub fn contains(&self, rev: RevisionId) -> bool {
        self.range_min <= rev && rev < self.range_max
    }

    /// Leaf index holding `rev`.
    pub fn leaf_index(&self, rev: RevisionId) -> Result<u64> {
        if !self.contains(rev) {
            return Err(CoreError::OutOfBounds {
                rev,
                min: self.range_min,
                max: self.range_max,
            });
        }
        Ok((rev.0 - self.range_min.0) / self.leaf_width())
    }

    /// Closed revision range of leaf `leaf`.
    pub fn leaf_range(&self, leaf: u64) -> RevisionRange {
        let width = self.leaf_width();
        let min = self.range_min.0 + leaf * width;
        RevisionRange {
            min: RevisionId(min),
            max: RevisionId(min + width - 1),
        }
    }

    /// Level and in-level index of the node at `pos`.
    pub fn locate(&self, pos: usize) -> (u32, u64) {
        let mut level = 0;
        while level < self.max_depth && pos >= self.level_offset(level + 1) {
            level += 1;
        }
        (level, (pos - self.level_offset(level)) as u64)
    }

    /// Leaves under the node at `pos`.
    pub fn leaf_span(&self, pos: usize) -> Range<u64> {
        let (level, index) = self.locate(pos);
        let per_node = u64::from(self.branch_factor).pow(self.max_depth - level);
        index * per_node..(index + 1) * per_node
    }

    /// Closed revision range summarised by the node at `pos`.
    pub fn node_range(&self, pos: usize) -> RevisionRange {
        let span = self.leaf_span(pos);
        RevisionRange {
            min: self.leaf_range(span.start).min,
            max: self.leaf_range(span.end - 1).max,
        }
    }

    /// Positions of the children of `pos`, or `None` for a leaf.
    pub fn children(&self, pos: usize) -> Option<Range<usize>> {
        if pos >= self.first_leaf_offset() {
            return None;
        }
        let b = self.branch_factor as usize;
        Some(pos * b + 1..pos * b + b + 1)
    }

    /// Position of the parent of `pos`, or `None` for the root.
    pub fn parent(&self, pos: usize) -> Option<usize> {
        (pos > 0).then(|| (pos - 1) / self.branch_factor as usize)
    }

    /// Leaf spans of the root's children, one per independent build task.
    ///
    /// A depth-0 tree has a single span.
    pub fn top_level_spans(&self) -> Vec<Range<u64>> {
        if self.max_depth == 0 {
            return vec![0..1];
        }
        (1..=self.branch_factor as usize)
            .map(|pos| self.leaf_span(pos))
            .collect()
    }
}

/// A dense revision tree.
///
/// Field names follow the wire shape: `{version, rangeMin, rangeMax,
/// maxDepth, branchFactor, nodes}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionTree {
    pub version: u32,
    pub range_min: RevisionId,
    pub range_max: RevisionId,
    pub max_depth: u32,
    #[serde(default = "default_branch_factor")]
    pub branch_factor: u32,
    pub nodes: Vec<RevisionNode>,
}

impl RevisionTree {
    /// A tree with every node empty.
    pub fn empty(geometry: TreeGeometry) -> Self {
        Self {
            version: geometry.version,
            range_min: geometry.range_min,
            range_max: geometry.range_max,
            max_depth: geometry.max_depth,
            branch_factor: geometry.branch_factor,
            nodes: vec![RevisionNode::EMPTY; geometry.node_count()],
        }
    }

    /// Assemble a tree from its leaf level; internal nodes are derived.
    pub fn from_leaves(geometry: TreeGeometry, leaves: Vec<RevisionNode>) -> Result<Self> {
        if leaves.len() as u64 != geometry.leaf_count() {
            return Err(CoreError::MalformedTree(format!(
                "expected {} leaves, got {}",
                geometry.leaf_count(),
                leaves.len()
            )));
        }
        let mut tree = Self::empty(geometry);
        let first_leaf = geometry.first_leaf_offset();
        tree.nodes[first_leaf..].copy_from_slice(&leaves);
        tree.recompute_internal();
        Ok(tree)
    }

    pub fn geometry(&self) -> TreeGeometry {
        TreeGeometry {
            version: self.version,
            range_min: self.range_min,
            range_max: self.range_max,
            max_depth: self.max_depth,
            branch_factor: self.branch_factor,
        }
    }

    pub fn root(&self) -> &RevisionNode {
        &self.nodes[0]
    }

    pub fn root_hash(&self) -> Digest {
        self.nodes[0].hash
    }

    /// Live revisions summarised by the tree.
    pub fn count(&self) -> u64 {
        self.nodes[0].count
    }

    /// The leaf level.
    pub fn leaves(&self) -> &[RevisionNode] {
        &self.nodes[self.geometry().first_leaf_offset()..]
    }

    /// Fold one document into its leaf and every ancestor.
    pub fn insert(&mut self, rev: RevisionId, digest: &Digest) -> Result<()> {
        let pos = self.leaf_position(rev)?;
        for p in self.path_to_root(pos) {
            self.nodes[p].add(digest);
        }
        Ok(())
    }

    /// Take one document out of its leaf and every ancestor.
    ///
    /// The leaf must currently hold at least one document.
    pub fn remove(&mut self, rev: RevisionId, digest: &Digest) -> Result<()> {
        let pos = self.leaf_position(rev)?;
        if self.nodes[pos].count == 0 {
            return Err(CoreError::MalformedTree(format!(
                "revision {rev} removed from an empty leaf"
            )));
        }
        for p in self.path_to_root(pos) {
            self.nodes[p].remove(digest)?;
        }
        Ok(())
    }

    /// Rebuild every internal node from the leaf level.
    pub fn recompute_internal(&mut self) {
        let geometry = self.geometry();
        let b = geometry.branch_factor as usize;
        for pos in (0..geometry.first_leaf_offset()).rev() {
            let mut node = RevisionNode::EMPTY;
            for child in pos * b + 1..pos * b + b + 1 {
                node.absorb(&self.nodes[child]);
            }
            self.nodes[pos] = node;
        }
    }

    /// Check geometry, node count, and that every internal node is the
    /// combination of its children.
    pub fn validate(&self) -> Result<()> {
        let geometry = self.geometry();
        geometry.validate()?;
        if self.nodes.len() != geometry.node_count() {
            return Err(CoreError::MalformedTree(format!(
                "expected {} nodes, got {}",
                geometry.node_count(),
                self.nodes.len()
            )));
        }
        let b = geometry.branch_factor as usize;
        for pos in 0..geometry.first_leaf_offset() {
            let mut expected = RevisionNode::EMPTY;
            for child in pos * b + 1..pos * b + b + 1 {
                expected.absorb(&self.nodes[child]);
            }
            if expected != self.nodes[pos] {
                return Err(CoreError::MalformedTree(format!(
                    "node {pos} does not match its children"
                )));
            }
        }
        Ok(())
    }

    fn leaf_position(&self, rev: RevisionId) -> Result<usize> {
        let geometry = self.geometry();
        let leaf = geometry.leaf_index(rev)?;
        Ok(geometry.first_leaf_offset() + leaf as usize)
    }

    fn path_to_root(&self, leaf_pos: usize) -> Vec<usize> {
        let geometry = self.geometry();
        let mut path = vec![leaf_pos];
        let mut pos = leaf_pos;
        while let Some(parent) = geometry.parent(pos) {
            path.push(parent);
            pos = parent;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(depth: u32) -> TreeGeometry {
        let leaves = 8u64.pow(depth);
        TreeGeometry::new(RevisionId(100), RevisionId(100 + leaves * 10), depth, 8).unwrap()
    }

    #[test]
    fn test_node_count_formula() {
        assert_eq!(node_count(8, 0), 1);
        assert_eq!(node_count(8, 1), 9);
        assert_eq!(node_count(8, 2), 73);
        assert_eq!(node_count(8, 4), 4681);
        assert_eq!(node_count(2, 3), 15);
    }

    #[test]
    fn test_level_offsets_and_children() {
        let g = geometry(2);
        assert_eq!(g.level_offset(0), 0);
        assert_eq!(g.level_offset(1), 1);
        assert_eq!(g.level_offset(2), 9);
        assert_eq!(g.first_leaf_offset(), 9);
        assert_eq!(g.children(0), Some(1..9));
        assert_eq!(g.children(1), Some(9..17));
        assert_eq!(g.children(9), None);
        assert_eq!(g.parent(9), Some(1));
        assert_eq!(g.parent(72), Some(8));
        assert_eq!(g.parent(0), None);
        assert_eq!(g.locate(0), (0, 0));
        assert_eq!(g.locate(8), (1, 7));
        assert_eq!(g.locate(72), (2, 63));
    }

    #[test]
    fn test_leaf_ranges_tile_the_tree() {
        let g = geometry(2);
        assert_eq!(g.leaf_width(), 10);
        let mut expected_min = g.range_min;
        for leaf in 0..g.leaf_count() {
            let r = g.leaf_range(leaf);
            assert_eq!(r.min, expected_min);
            assert_eq!(g.leaf_index(r.min).unwrap(), leaf);
            assert_eq!(g.leaf_index(r.max).unwrap(), leaf);
            expected_min = r.max.saturating_next();
        }
        assert_eq!(expected_min, g.range_max);
        assert_eq!(g.node_range(0), g.covered());
        assert!(g.leaf_index(g.range_max).is_err());
        assert!(g.leaf_index(RevisionId(99)).is_err());
    }

    #[test]
    fn test_for_population_depth_grows() {
        let options = TreeOptions::default();
        let small = TreeGeometry::for_population(&options, 10, Some((RevisionId(5), RevisionId(50))))
            .unwrap();
        assert_eq!(small.max_depth, 1);
        assert!(small.contains(RevisionId(5)));
        assert!(small.contains(RevisionId(50)));

        let big = TreeGeometry::for_population(
            &options,
            80_000,
            Some((RevisionId(1_000), RevisionId(1_000 + 79_999))),
        )
        .unwrap();
        assert_eq!(big.max_depth, 4);
        assert_eq!(big.node_count(), 4681);
        assert!(big.contains(RevisionId(1_000 + 79_999)));
    }

    #[test]
    fn test_for_population_empty() {
        let g = TreeGeometry::for_population(&TreeOptions::default(), 0, None).unwrap();
        assert_eq!(g.max_depth, DEFAULT_MIN_DEPTH);
        assert_eq!(g.range_min, RevisionId(1));
        assert_eq!(g.leaf_width(), 1);
    }

    #[test]
    fn test_for_population_near_top_shifts_down() {
        let g = TreeGeometry::for_population(
            &TreeOptions::default(),
            2,
            Some((RevisionId(u64::MAX - 3), RevisionId(u64::MAX - 1))),
        )
        .unwrap();
        assert_eq!(g.range_max, RevisionId::MAX);
        assert!(g.contains(RevisionId(u64::MAX - 3)));
        assert!(g.contains(RevisionId(u64::MAX - 1)));
    }

    #[test]
    fn test_geometry_rejects_uneven_range() {
        assert!(TreeGeometry::new(RevisionId(0), RevisionId(63), 2, 8).is_err());
        assert!(TreeGeometry::new(RevisionId(0), RevisionId(64), 2, 8).is_ok());
        assert!(TreeGeometry::new(RevisionId(0), RevisionId(64), 2, 1).is_err());
    }

    #[test]
    fn test_insert_remove_propagate() {
        let g = geometry(2);
        let mut tree = RevisionTree::empty(g);
        let d = Digest::hash(b"doc");
        tree.insert(RevisionId(105), &d).unwrap();
        assert_eq!(tree.count(), 1);
        assert_eq!(tree.root_hash(), d);
        assert_eq!(tree.nodes[1].count, 1);
        assert_eq!(tree.leaves()[0].count, 1);
        tree.validate().unwrap();

        tree.remove(RevisionId(105), &d).unwrap();
        assert_eq!(tree, RevisionTree::empty(g));
        assert!(tree.remove(RevisionId(105), &d).is_err());
        assert!(tree.insert(RevisionId(1), &d).is_err());
    }

    #[test]
    fn test_validate_detects_tampering() {
        let g = geometry(1);
        let mut tree = RevisionTree::empty(g);
        tree.insert(RevisionId(100), &Digest::hash(b"x")).unwrap();
        tree.nodes[3].count = 9;
        assert!(tree.validate().is_err());

        let mut short = RevisionTree::empty(g);
        short.nodes.pop();
        assert!(short.validate().is_err());
    }

    #[test]
    fn test_top_level_spans_partition_leaves() {
        let g = geometry(3);
        let spans = g.top_level_spans();
        assert_eq!(spans.len(), 8);
        assert_eq!(spans[0], 0..64);
        assert_eq!(spans[7], 448..512);
    }

    #[test]
    fn test_tree_json_shape() {
        let tree = RevisionTree::empty(geometry(1));
        let json = serde_json::to_value(&tree).unwrap();
        assert!(json.get("rangeMin").is_some());
        assert!(json.get("rangeMax").is_some());
        assert_eq!(json["maxDepth"], 1);
        assert_eq!(json["nodes"].as_array().unwrap().len(), 9);

        let mut stripped = json.clone();
        stripped.as_object_mut().unwrap().remove("branchFactor");
        let back: RevisionTree = serde_json::from_value(stripped).unwrap();
        assert_eq!(back, tree);
    }
}
