//! Tree comparison.
//!
//! Two trees with the same geometry are walked top-down, level by level.
//! Matching nodes prune their whole subtree; every leaf reached that still
//! differs yields its revision range. The output is ascending and disjoint.

use crate::error::{CoreError, Result};
use crate::tree::RevisionTree;
use crate::types::RevisionRange;

/// Revision ranges where `local` and `remote` may disagree.
///
/// Fails with [`CoreError::VersionMismatch`] if the trees differ in version,
/// fanout, depth or range, and with [`CoreError::MalformedTree`] if either
/// tree has the wrong number of nodes.
pub fn diff(local: &RevisionTree, remote: &RevisionTree) -> Result<Vec<RevisionRange>> {
    let geometry = local.geometry();
    if geometry != remote.geometry() {
        return Err(CoreError::VersionMismatch {
            local: geometry,
            remote: remote.geometry(),
        });
    }
    geometry.validate()?;
    let expected = geometry.node_count();
    for tree in [local, remote] {
        if tree.nodes.len() != expected {
            return Err(CoreError::MalformedTree(format!(
                "expected {expected} nodes, got {}",
                tree.nodes.len()
            )));
        }
    }

    let mut out = Vec::new();
    let mut frontier = vec![0usize];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for pos in frontier {
            if local.nodes[pos] == remote.nodes[pos] {
                continue;
            }
            match geometry.children(pos) {
                Some(children) => next.extend(children),
                None => out.push(geometry.node_range(pos)),
            }
        }
        frontier = next;
    }
    Ok(out)
}

/// Merge touching ranges in an ascending, disjoint list.
pub fn coalesce(ranges: &[RevisionRange]) -> Vec<RevisionRange> {
    let mut out: Vec<RevisionRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match out.last_mut() {
            Some(last) if last.max.0.checked_add(1) == Some(range.min.0) => {
                last.max = range.max;
            }
            _ => out.push(*range),
        }
    }
    out
}
