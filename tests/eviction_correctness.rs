#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;

use common::{
    file_attrs, make_files, populate_cold, quiet_config, resident, same_lane_files, small_config,
    start,
};
use fhcache::sim::SimBackend;
use fhcache::{CacheError, EntryState, LruConfig, QueueKind, RefFlag};
use tokio::task::JoinSet;

#[tokio::test]
async fn pinned_entry_is_never_reclaimed() {
    let sim = SimBackend::new();
    let ids = make_files(&sim, 20);
    let cache = start(&sim, quiet_config());
    let eids = populate_cold(&cache, &ids).await;

    cache.pin(eids[7]).unwrap();
    assert_eq!(cache.release_entries(1_000), 19);
    assert_eq!(cache.state(eids[7]).unwrap(), EntryState::Pinned);
    assert_eq!(cache.run_reclaim_pass().entries, 0);

    cache.unpin(eids[7]);
    assert_eq!(cache.inspect(eids[7]).unwrap().queue, QueueKind::Cold);
    assert_eq!(cache.release_entries(1_000), 1);
    assert!(!resident(&cache, eids[7]));
}

#[tokio::test]
async fn forced_release_never_takes_referenced_entries() {
    let sim = SimBackend::new();
    let ids = make_files(&sim, 30);
    let cache = start(&sim, quiet_config());

    let cold = populate_cold(&cache, &ids[..20]).await;
    let mut held = Vec::new();
    for id in &ids[20..] {
        held.push(cache.lookup_or_populate(*id).await.unwrap());
    }

    assert_eq!(cache.release_entries(100), 20);
    for eid in &held {
        assert_eq!(cache.state(*eid).unwrap(), EntryState::Active);
    }
    for eid in &cold {
        assert!(!resident(&cache, *eid));
    }
    assert_eq!(cache.stats().entries_used, 10);
    assert_eq!(sim.forgets(), 20);

    for eid in held {
        cache.release(eid);
    }
}

#[tokio::test]
async fn forced_release_returns_at_most_what_was_asked() {
    let sim = SimBackend::new();
    let ids = make_files(&sim, 40);
    let cache = start(&sim, quiet_config());
    populate_cold(&cache, &ids).await;

    assert_eq!(cache.release_entries(5), 5);
    assert_eq!(cache.stats().entries_used, 35);
    assert_eq!(cache.release_entries(0), 0);
}

#[tokio::test]
async fn forced_release_may_return_fewer() {
    let sim = SimBackend::new();
    let ids = make_files(&sim, 3);
    let cache = start(&sim, quiet_config());
    let eids = populate_cold(&cache, &ids).await;
    cache.pin(eids[0]).unwrap();

    assert_eq!(cache.release_entries(10), 2);
    assert!(resident(&cache, eids[0]));
}

#[tokio::test]
async fn pass_reclaims_down_to_the_watermark() {
    let sim = SimBackend::new();
    let ids = make_files(&sim, 100);
    let cache = start(&sim, small_config(50, 10));
    populate_cold(&cache, &ids).await;
    assert_eq!(cache.stats().entries_used, 100);

    let report = cache.run_reclaim_pass();
    let stats = cache.stats();
    assert!(report.entries <= 170, "a pass takes at most release-size per lane");
    assert_eq!(stats.entries_used, 50);
    assert_eq!(report.entries, 50);
    assert_eq!(stats.per_lane_work, 3, "ceil(50 / 17)");
    assert_eq!(stats.entries_reclaimed, 50);

    // At the watermark there is nothing more to do.
    assert_eq!(cache.run_reclaim_pass().entries, 0);
}

#[tokio::test]
async fn pass_leaves_referenced_entries_above_the_watermark() {
    let sim = SimBackend::new();
    let ids = make_files(&sim, 30);
    let cache = start(&sim, small_config(10, 5));

    let mut held = Vec::new();
    for id in &ids {
        held.push(cache.lookup_or_populate(*id).await.unwrap());
    }
    assert_eq!(cache.run_reclaim_pass().entries, 0);
    assert_eq!(cache.stats().entries_used, 30);

    for eid in held {
        cache.release(eid);
    }
    // Repeated passes converge once references are gone.
    for _ in 0..5 {
        if cache.stats().entries_used <= 10 {
            break;
        }
        cache.run_reclaim_pass();
    }
    assert_eq!(cache.stats().entries_used, 10);
}

#[tokio::test]
async fn cold_entries_go_before_warm_ones() {
    let sim = SimBackend::new();
    let ids = same_lane_files(&sim, 4);
    let cache = start(&sim, quiet_config());

    let cold = populate_cold(&cache, &ids[..2]).await;
    let warm = populate_cold(&cache, &ids[2..]).await;
    for eid in &warm {
        cache.promote(*eid).unwrap();
    }

    assert_eq!(cache.release_entries(2), 2);
    for eid in &cold {
        assert!(!resident(&cache, *eid), "cold entries should be reclaimed first");
    }
    for eid in &warm {
        assert_eq!(cache.inspect(*eid).unwrap().queue, QueueKind::Warm);
    }

    // With the cold queue empty, the warm tail is next.
    assert_eq!(cache.release_entries(1), 1);
    assert_eq!(cache.stats().entries_used, 1);
}

#[tokio::test]
async fn released_cold_entry_is_the_next_candidate() {
    let sim = SimBackend::new();
    let ids = same_lane_files(&sim, 3);
    let cache = start(&sim, quiet_config());
    let eids = populate_cold(&cache, &ids).await;

    // The oldest cold entry dropping back to the sentinel moves to the reclaim end.
    cache.acquire(eids[0], RefFlag::Touch).unwrap();
    cache.release(eids[0]);

    assert_eq!(cache.release_entries(1), 1);
    assert!(!resident(&cache, eids[0]));
    assert!(resident(&cache, eids[1]));
    assert!(resident(&cache, eids[2]));
}

#[tokio::test]
async fn temporary_borrow_keeps_the_queue_position() {
    let sim = SimBackend::new();
    let ids = same_lane_files(&sim, 3);
    let cache = start(&sim, quiet_config());
    let eids = populate_cold(&cache, &ids).await;

    // eids[2] sits at the cold tail and eids[0] furthest from it.
    cache.acquire(eids[0], RefFlag::TemporaryBorrow).unwrap();
    cache.release_borrow(eids[0]);
    assert_eq!(cache.inspect(eids[0]).unwrap().queue, QueueKind::Cold);

    assert_eq!(cache.release_entries(1), 1);
    assert!(resident(&cache, eids[0]));
    assert!(!resident(&cache, eids[2]));
}

#[tokio::test]
async fn unpinned_entry_returns_to_the_cold_head() {
    let sim = SimBackend::new();
    let ids = same_lane_files(&sim, 2);
    let cache = start(&sim, quiet_config());
    let eids = populate_cold(&cache, &ids).await;

    // eids[1] was released last, so it sits at the cold tail until it is pinned.
    cache.pin(eids[1]).unwrap();
    cache.unpin(eids[1]);

    assert_eq!(cache.release_entries(1), 1);
    assert!(resident(&cache, eids[1]));
    assert!(!resident(&cache, eids[0]));
}

#[tokio::test]
async fn warm_entries_reclaim_in_lru_order() {
    let sim = SimBackend::new();
    let ids = same_lane_files(&sim, 3);
    let cache = start(&sim, quiet_config());
    let eids = populate_cold(&cache, &ids).await;
    for eid in &eids {
        cache.promote(*eid).unwrap();
    }
    // Refresh the oldest warm entry; eids[1] becomes least recently used.
    cache.acquire(eids[0], RefFlag::Touch).unwrap();
    cache.release(eids[0]);

    assert_eq!(cache.release_entries(1), 1);
    assert!(!resident(&cache, eids[1]));
}

fn tight_config() -> LruConfig {
    LruConfig {
        entries_hiwat: 5,
        entries_hard_limit: 5,
        entries_release_size: 10,
        ..quiet_config()
    }
}

#[tokio::test]
async fn hard_limit_reports_no_space_when_nothing_is_reclaimable() {
    let sim = SimBackend::new();
    let ids = make_files(&sim, 6);
    let cache = start(&sim, tight_config());

    let mut held = Vec::new();
    for id in &ids[..5] {
        held.push(cache.lookup_or_populate(*id).await.unwrap());
    }

    let err = cache.lookup_or_populate(ids[5]).await.unwrap_err();
    assert!(matches!(err, CacheError::NoSpace { used: 5 }));
    assert_eq!(err.errno(), libc::ENOMEM);
    assert!(matches!(
        cache.insert_active(900, file_attrs(900)),
        Err(CacheError::NoSpace { .. })
    ));
    assert_eq!(sim.getattr_calls(), 5, "a refused lookup never reaches the backend");

    // One unreferenced entry is enough for the forced release to make room.
    cache.release(held.pop().unwrap());
    let eid = cache.lookup_or_populate(ids[5]).await.unwrap();
    assert_eq!(cache.state(eid).unwrap(), EntryState::Active);
    assert_eq!(cache.stats().entries_used, 5);
}

#[tokio::test]
async fn lookup_hit_is_served_at_the_hard_limit() {
    let sim = SimBackend::new();
    let ids = make_files(&sim, 5);
    let cache = start(&sim, tight_config());

    let mut held = Vec::new();
    for id in &ids {
        held.push(cache.lookup_or_populate(*id).await.unwrap());
    }
    let again = cache.lookup_or_populate(ids[0]).await.unwrap();
    assert_eq!(again, held[0]);
    cache.release(again);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_never_exceed_the_hard_limit() {
    let sim = SimBackend::new();
    let cache = Arc::new(start(&sim, tight_config()));

    let mut set = JoinSet::new();
    for id in 1_000..1_032u64 {
        let cache = Arc::clone(&cache);
        set.spawn(async move { cache.lookup_or_insert(id, file_attrs(id)) });
    }
    let mut held = Vec::new();
    let mut refused = 0;
    while let Some(joined) = set.join_next().await {
        match joined.unwrap() {
            Ok(eid) => held.push(eid),
            Err(CacheError::NoSpace { .. }) => refused += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    assert_eq!(held.len(), 5);
    assert_eq!(refused, 27);
    assert_eq!(cache.stats().entries_used, 5);
    assert_eq!(cache.stats().entries_peak, 5);
    for eid in held {
        cache.release(eid);
    }
}
