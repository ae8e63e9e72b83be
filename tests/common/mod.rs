#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::time::Duration;

use fhcache::sim::{ROOT, SimAttrs, SimBackend};
use fhcache::{EntryId, HandleCache, LruConfig, ObjectKind, lane_of};

pub type SimCache = HandleCache<SimBackend>;

/// A configuration whose background timer never fires during a test. Wake-ups from inserts are
/// throttled to a quarter of the interval, so passes only run when a test asks for one.
pub fn quiet_config() -> LruConfig {
    LruConfig {
        reclaim_interval_ms: 3_600_000,
        ..LruConfig::default()
    }
}

/// A quiet configuration with small entry watermarks.
pub fn small_config(entries_hiwat: u64, release_size: u32) -> LruConfig {
    LruConfig {
        entries_hiwat,
        entries_hard_limit: entries_hiwat * 4,
        entries_release_size: release_size,
        ..quiet_config()
    }
}

pub fn start(sim: &SimBackend, config: LruConfig) -> SimCache {
    HandleCache::start(sim.clone(), config).unwrap()
}

pub fn file_attrs(id: u64) -> SimAttrs {
    SimAttrs {
        id,
        kind: ObjectKind::File,
        size: 0,
    }
}

/// Create `n` files under the root of `sim`.
pub fn make_files(sim: &SimBackend, n: usize) -> Vec<u64> {
    (0..n)
        .map(|i| sim.add_file(ROOT, format!("f{i:05}"), 0).unwrap())
        .collect()
}

/// Create files under the root until `n` of them hash to the same lane, and return those.
pub fn same_lane_files(sim: &SimBackend, n: usize) -> Vec<u64> {
    let first = sim.add_file(ROOT, "lane-anchor", 0).unwrap();
    let lane = lane_of(&first);
    let mut ids = vec![first];
    let mut i = 0;
    while ids.len() < n {
        let id = sim.add_file(ROOT, format!("lane{i:05}"), 0).unwrap();
        if lane_of(&id) == lane {
            ids.push(id);
        }
        i += 1;
    }
    ids
}

/// Look up every id and release the lookup reference, leaving the entries unreferenced and cold.
pub async fn populate_cold(cache: &SimCache, ids: &[u64]) -> Vec<EntryId> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let eid = cache.lookup_or_populate(*id).await.unwrap();
        cache.release(eid);
        out.push(eid);
    }
    out
}

/// Whether `eid` still names a resident entry (live or zombie).
pub fn resident(cache: &SimCache, eid: EntryId) -> bool {
    cache.state(eid).is_ok()
}

/// Poll `cond` until it holds, or panic after about a second.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{what} did not happen within 1 second");
}
