//! Cache integration tests: chain walks against the state table.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nebucloud_fanout::prelude::*;
use proptest::prelude::*;

fn unbatched(full_every: u64) -> FanoutCache {
    FanoutCache::new(CacheConfig::unbatched().with_full_snapshot_interval(full_every))
}

/// Walk the chain from `start` to the tail, rebuilding the state from deltas.
fn replay(start: &Arc<Breadcrumb>) -> (Snapshot, Vec<Sequence>) {
    let mut state = start.snapshot().cloned().expect("walk must start at a Full");
    let mut seen = vec![start.sequence()];
    let mut crumb = Arc::clone(start);
    while let Some(next) = crumb.next_now() {
        state = state.apply(next.deltas());
        if let Some(full) = next.snapshot() {
            assert_eq!(&state, full, "delta replay diverged at {}", next.sequence());
        }
        seen.push(next.sequence());
        crumb = next;
    }
    (state, seen)
}

#[test]
fn scenario_full_then_deltas_then_tombstone() {
    let cache = unbatched(256);

    cache.ingest(vec![Update::upsert("k1", "v1")], None).unwrap();
    let first = cache.current_breadcrumb().unwrap();
    assert!(first.is_full());
    assert_eq!(first.snapshot().unwrap().get("k1"), Some(&Bytes::from("v1")));

    cache
        .ingest(vec![Update::upsert("k1", "v2"), Update::upsert("k2", "v3")], None)
        .unwrap();
    let second = first.next_now().unwrap();
    assert_eq!(second.kind(), BreadcrumbKind::Delta);
    assert_eq!(
        second.deltas(),
        &[Update::upsert("k1", "v2"), Update::upsert("k2", "v3")]
    );

    cache.ingest(vec![Update::delete("k1")], None).unwrap();
    let third = second.next_now().unwrap();
    assert_eq!(third.deltas(), &[Update::delete("k1")]);

    let (state, seen) = replay(&first);
    assert_eq!(state, cache.snapshot());
    assert_eq!(seen, vec![Sequence::new(1), Sequence::new(2), Sequence::new(3)]);
}

#[test]
fn collapsing_within_batch_window() {
    let cache = FanoutCache::new(
        CacheConfig::default()
            .with_max_batch_size(100)
            .with_max_batch_delay(Duration::from_secs(3600)),
    );
    cache.ingest(vec![Update::upsert("seed", "x")], None).unwrap();
    cache.flush();
    let first = cache.tail().unwrap();

    cache.ingest(vec![Update::upsert("a", "1")], None).unwrap();
    cache.ingest(vec![Update::upsert("a", "2")], None).unwrap();
    cache.flush();

    let delta = first.next_now().unwrap();
    assert_eq!(delta.deltas(), &[Update::upsert("a", "2")]);
    assert!(delta.next_now().is_none());
}

#[test]
fn status_transition_cuts_full_and_is_not_batched() {
    let cache = FanoutCache::new(
        CacheConfig::default().with_max_batch_delay(Duration::from_secs(3600)),
    );
    cache
        .ingest(vec![Update::upsert("a", "1")], Some(SyncStatus::Resyncing))
        .unwrap();
    assert_eq!(cache.latest_sequence(), None);

    let seq = cache
        .ingest(vec![Update::upsert("b", "2")], Some(SyncStatus::InSync))
        .unwrap();
    assert_eq!(seq, Some(Sequence::FIRST));

    let crumb = cache.tail().unwrap();
    assert!(crumb.is_full());
    assert!(crumb.sync_status().is_in_sync());
    assert_eq!(crumb.snapshot().unwrap().len(), 2);
}

#[test]
fn rejected_batch_changes_nothing() {
    let cache = unbatched(256);
    cache.ingest(vec![Update::upsert("a", "1")], None).unwrap();

    let err = cache
        .ingest(vec![Update::upsert("b", "2"), Update::upsert("", "bad")], None)
        .unwrap_err();
    assert!(matches!(err, FanoutError::InvalidUpdate { .. }));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.latest_sequence(), Some(Sequence::FIRST));
    assert_eq!(cache.stats().batches_rejected(), 1);
}

#[test]
fn released_prefix_is_reclaimed() {
    let cache = unbatched(4);
    let reader = {
        cache.ingest(vec![Update::upsert("k", "0")], None).unwrap();
        cache.current_breadcrumb().unwrap()
    };
    for i in 1..12 {
        cache
            .ingest(vec![Update::upsert("k", i.to_string())], None)
            .unwrap();
    }
    assert_eq!(cache.stats().live_breadcrumbs(), 12);

    // The reader was the only thing holding 1..=8 alive; the cache keeps
    // the latest Full (9) and everything after it.
    drop(reader);
    assert_eq!(cache.stats().live_breadcrumbs(), 4);
}

fn arb_update() -> impl Strategy<Value = Update> {
    (0u8..8, proptest::option::of(0u8..3)).prop_map(|(k, v)| Update {
        key: Key::new(format!("/k{k}")),
        value: v.map(|v| Bytes::from(vec![v])),
    })
}

proptest! {
    #[test]
    fn replaying_deltas_reproduces_every_full(
        batches in proptest::collection::vec(
            proptest::collection::vec(arb_update(), 1..6), 1..40),
        full_every in 1u64..6,
    ) {
        let cache = unbatched(full_every);
        // Seed so the walk has a starting point.
        cache.ingest(vec![Update::upsert("/seed", "s")], None).unwrap();
        let start = cache.current_breadcrumb().unwrap();

        for batch in batches {
            cache.ingest(batch, None).unwrap();
        }

        let (state, seen) = replay(&start);
        prop_assert_eq!(state, cache.snapshot());
        for pair in seen.windows(2) {
            prop_assert_eq!(pair[1], pair[0].next());
        }
    }
}
