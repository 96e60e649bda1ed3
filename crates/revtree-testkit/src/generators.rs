//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use proptest::prelude::*;

use revtree_core::{Digest, RevisionId, RevisionRange, TreeOptions, Value};

use crate::fixtures::UserDoc;

/// Generate a random RevisionId, never zero.
pub fn revision_id() -> impl Strategy<Value = RevisionId> {
    (1u64..=u64::MAX - 1).prop_map(RevisionId)
}

/// Generate a RevisionId clustered near the low end, where collisions between
/// generated sets are likely.
pub fn dense_revision_id() -> impl Strategy<Value = RevisionId> {
    (1u64..=4096).prop_map(RevisionId)
}

/// Generate a random Digest.
pub fn digest() -> impl Strategy<Value = Digest> {
    any::<[u8; 32]>().prop_map(Digest::from_bytes)
}

/// Generate a closed range with `min <= max`.
pub fn revision_range() -> impl Strategy<Value = RevisionRange> {
    (revision_id(), revision_id()).prop_map(|(a, b)| RevisionRange {
        min: a.min(b),
        max: a.max(b),
    })
}

/// Generate up to `max_len` `(rev, digest)` entries with distinct revisions,
/// ascending.
pub fn leaf_entries(max_len: usize) -> impl Strategy<Value = Vec<(RevisionId, Digest)>> {
    prop::collection::btree_map(dense_revision_id(), digest(), 0..=max_len)
        .prop_map(|map: BTreeMap<_, _>| map.into_iter().collect())
}

/// Generate valid tree options with small trees.
pub fn tree_options() -> impl Strategy<Value = TreeOptions> {
    (2u32..=16, 1u64..=128, 0u32..=2, 0u32..=3).prop_map(|(b, density, min, extra)| {
        TreeOptions::default()
            .with_branch_factor(b)
            .with_leaf_density(density)
            .with_depth_bounds(min, min + extra)
    })
}

/// Generate a user record.
pub fn user_doc() -> impl Strategy<Value = UserDoc> {
    ("[A-Z][a-z]{0,11}", 0u32..=120).prop_map(|(name, age)| UserDoc { name, age })
}

/// Generate a small document body with distinct field names.
pub fn body() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(|n| Value::Integer(n.into())),
        "[a-z ]{0,16}".prop_map(Value::Text),
        any::<bool>().prop_map(Value::Bool),
        Just(Value::Null),
    ];
    prop::collection::btree_map("[a-z]{1,8}", leaf, 0..6).prop_map(|fields| {
        Value::Map(
            fields
                .into_iter()
                .map(|(k, v)| (Value::Text(k), v))
                .collect(),
        )
    })
}

/// A write against a collection, addressed by a small key space so that
/// updates and removals hit existing documents.
#[derive(Debug, Clone)]
pub enum Mutation {
    Upsert { key: u8, doc: UserDoc },
    Remove { key: u8 },
}

impl Mutation {
    pub fn key(&self) -> String {
        let k = match self {
            Mutation::Upsert { key, .. } | Mutation::Remove { key } => *key,
        };
        format!("k{k:03}")
    }
}

impl Arbitrary for Mutation {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            3 => (0u8..64, user_doc()).prop_map(|(key, doc)| Mutation::Upsert { key, doc }),
            1 => (0u8..64).prop_map(|key| Mutation::Remove { key }),
        ]
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revtree_core::{build_tree, canonical_value_bytes};

    proptest! {
        #[test]
        fn test_leaf_entries_sorted_distinct(entries in leaf_entries(64)) {
            for pair in entries.windows(2) {
                prop_assert!(pair[0].0 < pair[1].0);
            }
        }

        #[test]
        fn test_generated_options_valid(options in tree_options()) {
            prop_assert!(options.validate().is_ok());
        }

        #[test]
        fn test_generated_trees_build(options in tree_options(), entries in leaf_entries(200)) {
            let tree = build_tree(&options, &entries).unwrap();
            prop_assert_eq!(tree.count(), entries.len() as u64);
        }

        #[test]
        fn test_bodies_encode(body in body()) {
            prop_assert!(canonical_value_bytes(&body).is_ok());
        }
    }
}
