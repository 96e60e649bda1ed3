//! End-to-end scenarios over a populated collection.
//!
//! These run the full serving path (tree build, paged resolution, document
//! fetch) against a single store and check the results against what was
//! inserted.

use std::collections::HashSet;

use revtree::core::{diff, node_count, RevisionRange};
use revtree::store::{Store, StoreExt};
use revtree::sync::{
    build_aligned_tree, CancellationToken, DocumentFetcher, RangeResolver, RevisionSource,
    SyncConfig, DEFAULT_PAGE_SIZE,
};
use revtree_testkit::fixtures::FIXTURE_TTL;
use revtree_testkit::{init_tracing, user, TestFixture, UserDoc, USERS};

#[tokio::test]
async fn test_eighty_thousand_documents() -> anyhow::Result<()> {
    init_tracing();
    const N: usize = 80_000;

    let (fixture, inserted) = TestFixture::with_users(N).await?;
    let source = fixture.source();
    let snapshot = source.open_snapshot(USERS, FIXTURE_TTL).await?;

    let tree = source.revision_tree(&snapshot).await?;
    let geometry = tree.geometry();
    assert_eq!(tree.count(), N as u64);
    assert_eq!(
        tree.nodes.len() as u64,
        node_count(geometry.branch_factor, geometry.max_depth)
    );
    tree.validate()?;

    let config = SyncConfig::default();
    let mut resolver =
        RangeResolver::new(&source, snapshot.clone(), vec![geometry.covered()], &config)?;
    let mut revs = Vec::with_capacity(N);
    let mut pages = 0;
    while let Some(page) = resolver.next_page().await? {
        pages += 1;
        revs.extend(page.ranges.into_iter().flatten());
    }
    assert!(pages >= N / DEFAULT_PAGE_SIZE, "expected many pages, got {pages}");
    assert_eq!(revs.len(), N);
    assert_eq!(revs.iter().collect::<HashSet<_>>().len(), N);
    assert!(revs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(revs, inserted);

    let fetcher = DocumentFetcher::new(&source, snapshot.clone(), &config);
    let documents = fetcher.fetch(&revs).await?;
    assert_eq!(documents.len(), N);
    for (i, document) in documents.iter().enumerate() {
        let (key, expected) = user(i);
        assert_eq!(document.rev, revs[i]);
        assert_eq!(document.key, key);
        assert_eq!(document.decode::<UserDoc>()?, expected);
    }

    source.close_snapshot(&snapshot).await?;
    Ok(())
}

#[tokio::test]
async fn test_delete_touches_one_leaf() -> anyhow::Result<()> {
    init_tracing();
    let (fixture, revs) = TestFixture::with_users(5_000).await?;
    let source = fixture.source();

    let before = source.open_snapshot(USERS, FIXTURE_TTL).await?;
    let old_tree = source.revision_tree(&before).await?;
    let geometry = old_tree.geometry();

    let victim = revs[1_234];
    let victim_digest = fixture
        .store
        .snapshot_digests(&before, RevisionRange::new(victim, victim)?)
        .await?
        .into_iter()
        .map(|(_, digest)| digest)
        .next()
        .expect("victim is live");
    let leaf = geometry.leaf_range(geometry.leaf_index(victim)?);
    let leaf_count = fixture.store.snapshot_digests(&before, leaf).await?.len();

    let (key, _) = user(1_234);
    assert_eq!(fixture.store.remove_document(USERS, &key).await?, victim);

    let mut new_tree = old_tree.clone();
    new_tree.remove(victim, &victim_digest)?;
    assert_ne!(new_tree.root_hash(), old_tree.root_hash());
    assert_eq!(new_tree.count(), old_tree.count() - 1);

    let ranges = diff(&old_tree, &new_tree)?;
    assert_eq!(ranges, vec![leaf]);

    // the maintained tree matches a fresh build aligned to the same geometry
    let after = source.open_snapshot(USERS, FIXTURE_TTL).await?;
    let rebuilt = build_aligned_tree(
        fixture.store.clone(),
        &after,
        geometry,
        &CancellationToken::new(),
    )
    .await?;
    assert_eq!(rebuilt, new_tree);

    let config = SyncConfig::default();
    let resolved = RangeResolver::new(&source, after.clone(), ranges, &config)?
        .resolve_all()
        .await?;
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].len(), leaf_count - 1);
    assert!(!resolved[0].contains(&victim));

    // ranges outside the touched leaf resolve as before
    let covered = geometry.covered();
    let outside: Vec<_> = [
        (leaf.min > covered.min).then(|| RevisionRange {
            min: covered.min,
            max: leaf.min.saturating_prev(),
        }),
        (leaf.max < covered.max).then(|| RevisionRange {
            min: leaf.max.saturating_next(),
            max: covered.max,
        }),
    ]
    .into_iter()
    .flatten()
    .collect();
    assert!(!outside.is_empty());
    let outside_before = RangeResolver::new(&source, before.clone(), outside.clone(), &config)?
        .resolve_all()
        .await?;
    let outside_after = RangeResolver::new(&source, after.clone(), outside, &config)?
        .resolve_all()
        .await?;
    assert_eq!(outside_before, outside_after);
    assert_eq!(
        outside_after.iter().map(Vec::len).sum::<usize>(),
        revs.len() - leaf_count
    );

    source.close_snapshot(&before).await?;
    source.close_snapshot(&after).await?;
    Ok(())
}

#[tokio::test]
async fn test_repeated_pass_is_identical() -> anyhow::Result<()> {
    init_tracing();
    let (fixture, _) = TestFixture::with_users(3_000).await?;
    let source = fixture.source().with_page_size(700);
    let snapshot = source.open_snapshot(USERS, FIXTURE_TTL).await?;
    let config = SyncConfig::default();

    // follower missing every third document
    let follower = TestFixture::new().await?;
    let records: Vec<_> = (0..3_000).filter(|i| i % 3 != 0).map(user).collect();
    follower.store.insert_records(USERS, &records).await?;

    let mut passes = Vec::new();
    for _ in 0..2 {
        let remote_tree = source.revision_tree(&snapshot).await?;
        let local = follower.snapshot().await?;
        let local_tree = build_aligned_tree(
            follower.store.clone(),
            &local,
            remote_tree.geometry(),
            &CancellationToken::new(),
        )
        .await?;
        follower.store.delete_snapshot(&local).await?;

        let ranges = diff(&local_tree, &remote_tree)?;
        let revs: Vec<_> = RangeResolver::new(&source, snapshot.clone(), ranges.clone(), &config)?
            .resolve_all()
            .await?
            .into_iter()
            .flatten()
            .collect();
        let documents = DocumentFetcher::new(&source, snapshot.clone(), &config)
            .fetch(&revs)
            .await?;
        passes.push((ranges, revs, documents));
    }

    assert!(!passes[0].0.is_empty());
    assert_eq!(passes[0], passes[1]);
    source.close_snapshot(&snapshot).await?;
    Ok(())
}
