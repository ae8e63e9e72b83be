//! Cache-wide counters.
//!
//! Created with the engine and shared by every component. All counters are relaxed atomics: they
//! drive watermark decisions and observability, never correctness, so a momentarily stale read
//! only shifts when a reclamation pass happens.

use std::time::Instant;

use serde::Serialize;

use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug)]
pub(crate) struct CacheCounters {
    entries_used: AtomicU64,
    entries_peak: AtomicU64,
    chunks_used: AtomicU64,
    per_lane_work: AtomicU64,
    /// Milliseconds since `epoch` at which the last background pass ran.
    prev_pass_ms: AtomicU64,
    passes: AtomicU64,
    reclaimed: AtomicU64,
    chunks_reclaimed: AtomicU64,
    /// Round-robin starting lane for the next forced release.
    lane_cursor: AtomicUsize,
    epoch: Instant,
}

impl CacheCounters {
    pub(crate) fn new() -> Self {
        Self {
            entries_used: AtomicU64::new(0),
            entries_peak: AtomicU64::new(0),
            chunks_used: AtomicU64::new(0),
            per_lane_work: AtomicU64::new(0),
            prev_pass_ms: AtomicU64::new(0),
            passes: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            chunks_reclaimed: AtomicU64::new(0),
            lane_cursor: AtomicUsize::new(0),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn entries_used(&self) -> u64 {
        self.entries_used.load(Ordering::Relaxed)
    }

    pub(crate) fn chunks_used(&self) -> u64 {
        self.chunks_used.load(Ordering::Relaxed)
    }

    /// Count one more entry unless that would exceed `limit`. Returns the count including it.
    pub(crate) fn try_reserve_entry(&self, limit: u64) -> Option<u64> {
        let prev = self
            .entries_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                (used < limit).then_some(used + 1)
            })
            .ok()?;
        let used = prev + 1;
        self.entries_peak.fetch_max(used, Ordering::Relaxed);
        Some(used)
    }

    pub(crate) fn entries_removed(&self, n: u64) {
        if n > 0 {
            self.entries_used.fetch_sub(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn chunk_added(&self) -> u64 {
        self.chunks_used.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn chunks_removed(&self, n: u64) {
        if n > 0 {
            self.chunks_used.fetch_sub(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_reclaimed(&self, entries: u64, chunks: u64) {
        self.reclaimed.fetch_add(entries, Ordering::Relaxed);
        self.chunks_reclaimed.fetch_add(chunks, Ordering::Relaxed);
    }

    pub(crate) fn set_per_lane_work(&self, work: u64) {
        self.per_lane_work.store(work, Ordering::Relaxed);
    }

    /// The lane a forced release should start from. Advances by one on every call so successive
    /// releases do not always hammer lane zero first.
    pub(crate) fn next_lane_cursor(&self) -> usize {
        self.lane_cursor.fetch_add(1, Ordering::Relaxed)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Claim the next background pass if at least `gap_ms` have passed since the last one (or
    /// since start-up). Exactly one of several concurrent callers wins a given slot.
    pub(crate) fn claim_pass(&self, gap_ms: u64) -> bool {
        let now = self.now_ms();
        let prev = self.prev_pass_ms.load(Ordering::Relaxed);
        if now.saturating_sub(prev) < gap_ms {
            return false;
        }
        self.prev_pass_ms
            .compare_exchange(prev, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Record the start of a background pass.
    pub(crate) fn begin_pass(&self) {
        self.prev_pass_ms.store(self.now_ms(), Ordering::Relaxed);
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            entries_used: self.entries_used.load(Ordering::Relaxed),
            entries_peak: self.entries_peak.load(Ordering::Relaxed),
            chunks_used: self.chunks_used.load(Ordering::Relaxed),
            per_lane_work: self.per_lane_work.load(Ordering::Relaxed),
            last_pass_ms: self.prev_pass_ms.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            entries_reclaimed: self.reclaimed.load(Ordering::Relaxed),
            chunks_reclaimed: self.chunks_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of the cache-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheStats {
    /// Entries currently resident, zombies included.
    pub entries_used: u64,
    /// Highest value `entries_used` has reached.
    pub entries_peak: u64,
    /// Directory chunks currently resident.
    pub chunks_used: u64,
    /// Per-lane quota computed by the most recent background pass.
    pub per_lane_work: u64,
    /// When the last background pass ran, in milliseconds since the engine started.
    pub last_pass_ms: u64,
    /// Number of background passes run.
    pub passes: u64,
    /// Entries reclaimed by background passes and forced releases.
    pub entries_reclaimed: u64,
    /// Chunks evicted by the chunk watermark pass or on chunk allocation.
    pub chunks_reclaimed: u64,
}
