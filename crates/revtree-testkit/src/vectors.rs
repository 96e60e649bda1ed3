//! Golden test vectors for deterministic verification.
//!
//! These vectors pin the portable encodings and tree shapes that every
//! replica has to agree on.

use revtree_core::{node_count, RevisionId, TreeOptions};

/// A revision and its compact token.
#[derive(Debug, Clone)]
pub struct TokenVector {
    pub rev: u64,
    pub token: &'static str,
}

/// Expected shape of a tree for a population size.
#[derive(Debug, Clone)]
pub struct ShapeVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    pub branch_factor: u32,
    pub population: u64,
    pub depth: u32,
    pub nodes: u64,
}

/// Revision token vectors.
pub fn token_vectors() -> Vec<TokenVector> {
    vec![
        TokenVector { rev: 0, token: "-" },
        TokenVector { rev: 1, token: "_" },
        TokenVector { rev: 2, token: "A" },
        TokenVector { rev: 27, token: "Z" },
        TokenVector { rev: 28, token: "a" },
        TokenVector { rev: 63, token: "9" },
        TokenVector { rev: 64, token: "_-" },
        TokenVector { rev: 100, token: "_i" },
        TokenVector { rev: 4096, token: "_--" },
        TokenVector {
            rev: u64::MAX,
            token: "N9999999999",
        },
    ]
}

/// Tree shape vectors under the default leaf density.
pub fn shape_vectors() -> Vec<ShapeVector> {
    vec![
        ShapeVector {
            name: "empty collection",
            branch_factor: 8,
            population: 0,
            depth: 1,
            nodes: 9,
        },
        ShapeVector {
            name: "one full level",
            branch_factor: 8,
            population: 512,
            depth: 1,
            nodes: 9,
        },
        ShapeVector {
            name: "just past one level",
            branch_factor: 8,
            population: 513,
            depth: 2,
            nodes: 73,
        },
        ShapeVector {
            name: "eighty thousand documents",
            branch_factor: 8,
            population: 80_000,
            depth: 4,
            nodes: 4681,
        },
        ShapeVector {
            name: "capped at max depth",
            branch_factor: 8,
            population: u64::MAX,
            depth: 6,
            nodes: 299_593,
        },
        ShapeVector {
            name: "binary fanout",
            branch_factor: 2,
            population: 1_000,
            depth: 4,
            nodes: 31,
        },
        ShapeVector {
            name: "wide fanout",
            branch_factor: 16,
            population: 10_000,
            depth: 2,
            nodes: 273,
        },
    ]
}

/// Check every vector, returning `(name, passed, detail)` per vector.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    let tokens = token_vectors().into_iter().map(|v| {
        let got = RevisionId(v.rev).to_token();
        let back = RevisionId::from_token(v.token).ok().map(RevisionId::get);
        let passed = got == v.token && back == Some(v.rev);
        (format!("token {}", v.rev), passed, got)
    });
    let shapes = shape_vectors().into_iter().map(|v| {
        let options = TreeOptions::default().with_branch_factor(v.branch_factor);
        let depth = options.depth_for(v.population);
        let nodes = node_count(v.branch_factor, depth);
        let passed = depth == v.depth && nodes == v.nodes;
        (v.name.to_string(), passed, format!("depth {depth}, {nodes} nodes"))
    });
    tokens.chain(shapes).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_vectors_pass() {
        for (name, passed, detail) in verify_all_vectors() {
            assert!(passed, "vector '{name}' failed: {detail}");
        }
    }
}
