//! A concurrent synthetic workload against the simulated backend.
//!
//! Every worker walks the tree the way a busy NFS client population would: listing directories
//! chunk by chunk, resuming from cookies, looking up and holding files, pinning some of them as
//! if they were open, and occasionally killing one as if it had been unlinked behind the
//! cache's back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fhcache::sim::{ROOT, SimBackend};
use fhcache::{CacheError, CacheStats, ChunkId, EntryId, HandleCache, RefFlag};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app_config::Config;

#[derive(Debug, Default)]
struct Tally {
    ops: AtomicU64,
    stale: AtomicU64,
    expired: AtomicU64,
    errors: AtomicU64,
}

impl Tally {
    fn record(&self, result: Result<(), CacheError>) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => {}
            Err(CacheError::Stale) => {
                self.stale.fetch_add(1, Ordering::Relaxed);
            }
            Err(CacheError::Expired(_)) => {
                self.expired.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!(error = %err, "soak operation failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Deterministic per-worker operation stream.
struct Stride(u64);

impl Stride {
    fn next(&mut self) -> u64 {
        // xorshift64
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        usize::try_from(self.next() % n.max(1) as u64).unwrap_or(0)
    }
}

type Cache = HandleCache<SimBackend>;

/// List all of `dir`, returning the identities of its children.
async fn list_dir(cache: &Cache, dir: EntryId) -> Result<Vec<u64>, CacheError> {
    let mut ids = Vec::new();
    let mut whence = 0;
    let mut prev: Option<ChunkId> = None;
    loop {
        let chunk = match cache.get_chunk(dir, prev, whence).await {
            Ok(chunk) => chunk,
            Err(err) => {
                if let Some(prev) = prev {
                    cache.release_chunk(prev);
                }
                return Err(err);
            }
        };
        ids.extend(chunk.entries_after(whence).iter().map(|d| d.id));
        prev = Some(chunk.id());
        match chunk.next_whence() {
            Some(next) if next != whence => whence = next,
            _ => break,
        }
    }
    if let Some(prev) = prev {
        cache.release_chunk(prev);
    }
    Ok(ids)
}

/// Read the first chunk of `dir`, hand out a cookie, and resume from it.
async fn resume_from_cookie(cache: &Cache, dir: EntryId, pick: usize) -> Result<(), CacheError> {
    let chunk = cache.get_chunk(dir, None, 0).await?;
    let len = chunk.dirents().len();
    let result = if len == 0 {
        Ok(())
    } else {
        let index = pick % len;
        cache
            .map_dirent(chunk.id(), index)
            .and_then(|cookie| cache.unmap_dirent(cookie))
            .map(|_| ())
    };
    cache.release_chunk(chunk.id());
    result
}

async fn hold_file(cache: &Cache, id: u64, op: u64) -> Result<(), CacheError> {
    let eid = cache.lookup_or_populate(id).await?;
    let result = match op % 20 {
        0 => {
            cache.kill(eid);
            Ok(())
        }
        1..=3 => match cache.pin(eid) {
            Ok(()) => {
                tokio::task::yield_now().await;
                cache.unpin(eid);
                Ok(())
            }
            Err(err) => Err(err),
        },
        4 => {
            cache.deferred_release(eid);
            Ok(())
        }
        5 => cache
            .acquire(eid, RefFlag::TemporaryBorrow)
            .map(|()| cache.release_borrow(eid)),
        _ =>cache.acquire(eid, RefFlag::Touch).map(|()| cache.release(eid)),
    };
    cache.release(eid);
    result
}

async fn worker(
    cache: Arc<Cache>,
    dirs: Arc<[u64]>,
    seed: u64,
    deadline: Instant,
    tally: Arc<Tally>,
) {
    let mut stride = Stride(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1);
    let mut known: Vec<u64> = Vec::new();

    while Instant::now() < deadline {
        let op = stride.next();
        let dir_id = dirs[stride.below(dirs.len())];
        let result = match op % 10 {
            0 => match cache.lookup_or_populate(dir_id).await {
                Ok(dir) => {
                    let listed = list_dir(&cache, dir).await;
                    cache.release(dir);
                    listed.map(|ids| {
                        known = ids;
                    })
                }
                Err(err) => Err(err),
            },
            1 => match cache.lookup_or_populate(dir_id).await {
                Ok(dir) => {
                    let resumed = resume_from_cookie(&cache, dir, stride.below(1 << 16)).await;
                    cache.release(dir);
                    resumed
                }
                Err(err) => Err(err),
            },
            _ if known.is_empty() => Ok(()),
            _ => {
                let id = known[stride.below(known.len())];
                hold_file(&cache, id, op).await
            }
        };
        tally.record(result);
        if op % 64 == 0 {
            tokio::task::yield_now().await;
        }
    }
}

#[derive(Debug, Error)]
pub enum SoakError {
    #[error("invalid cache configuration: {0}")]
    Config(#[from] fhcache::ConfigError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Outcome of a soak run.
#[derive(Debug)]
pub struct SoakReport {
    pub ops: u64,
    pub stale: u64,
    pub expired: u64,
    pub errors: u64,
    pub stats: CacheStats,
    pub within_watermark: bool,
}

pub async fn run(config: &Config, seconds: u64, workers: usize) -> Result<SoakReport, SoakError> {
    let sim = SimBackend::with_tree(config.sim.dirs, config.sim.files_per_dir);
    sim.set_latency(Duration::from_micros(config.sim.latency_us));
    let cache = Arc::new(HandleCache::start(sim, config.cache.clone())?);

    let root = cache.lookup_or_populate(ROOT).await?;
    let dirs: Arc<[u64]> = list_dir(&cache, root).await?.into();
    cache.release(root);
    info!(dirs = dirs.len(), workers, seconds, "starting soak");

    let tally = Arc::new(Tally::default());
    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut set = JoinSet::new();
    for seed in 0..workers as u64 {
        set.spawn(worker(
            Arc::clone(&cache),
            Arc::clone(&dirs),
            seed + 1,
            deadline,
            Arc::clone(&tally),
        ));
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(config.sim.stats_interval_ms));
    loop {
        tokio::select! {
            joined = set.join_next() => {
                match joined {
                    Some(Err(err)) => warn!(error = %err, "soak worker failed"),
                    Some(Ok(())) => {}
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let stats = cache.stats();
                info!(
                    ops = tally.ops.load(Ordering::Relaxed),
                    entries = stats.entries_used,
                    chunks = stats.chunks_used,
                    reclaimed = stats.entries_reclaimed,
                    "soak progress"
                );
            }
        }
    }

    let pass = cache.run_reclaim_pass();
    let stats = cache.stats();
    let within_watermark = stats.entries_used <= config.cache.entries_hiwat;
    if !within_watermark {
        warn!(
            used = stats.entries_used,
            hiwat = config.cache.entries_hiwat,
            "entries above the watermark after a final pass"
        );
    }
    debug!(?pass, "final reclamation pass");
    cache.shutdown().await;

    Ok(SoakReport {
        ops: tally.ops.load(Ordering::Relaxed),
        stale: tally.stale.load(Ordering::Relaxed),
        expired: tally.expired.load(Ordering::Relaxed),
        errors: tally.errors.load(Ordering::Relaxed),
        stats,
        within_watermark,
    })
}
