//! Revision tree benchmarks.
//!
//! ```bash
//! cargo bench -p revtree-testkit --bench tree
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use revtree_core::{build_aligned, build_tree, diff, Digest, RevisionId, TreeOptions};

fn entries(n: u64, rng: &mut StdRng) -> Vec<(RevisionId, Digest)> {
    let mut entries: Vec<_> = (1..=n)
        .map(|rev| (RevisionId(rev), Digest::from_bytes(rng.gen())))
        .collect();
    entries.shuffle(rng);
    entries
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_tree");
    let mut rng = StdRng::seed_from_u64(7);
    let options = TreeOptions::default();

    for n in [1_000u64, 10_000, 80_000] {
        let input = entries(n, &mut rng);
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &input, |b, input| {
            b.iter(|| build_tree(&options, black_box(input)))
        });
    }
    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    let mut rng = StdRng::seed_from_u64(11);
    let options = TreeOptions::default();

    for changed in [0usize, 10, 1_000] {
        let base = entries(80_000, &mut rng);
        let Ok(local) = build_tree(&options, &base) else {
            return;
        };
        let mut edited = base.clone();
        for entry in edited.iter_mut().take(changed) {
            entry.1 = Digest::from_bytes(rng.gen());
        }
        let Ok(remote) = build_aligned(local.geometry(), edited) else {
            return;
        };

        group.bench_with_input(BenchmarkId::from_parameter(changed), &remote, |b, remote| {
            b.iter(|| diff(black_box(&local), black_box(remote)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build, bench_diff);
criterion_main!(benches);
