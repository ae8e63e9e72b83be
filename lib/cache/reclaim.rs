//! Background reclamation.
//!
//! A single tokio task per engine enforces the entry and chunk watermarks. It wakes on a timer,
//! on an explicit [`Message::Wake`] sent by inserts that crossed the soft watermark, and on
//! deferred teardowns handed over by request paths that must not pay for destruction inline.
//!
//! The worker only ever removes resident entries; it issues no fallible I/O and cannot fail.

use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::core::CacheCore;
use super::lane::{EntryId, LANES, Teardown};
use crate::backend::Backend;
use crate::sync::Arc;

/// A wake-up may run a pass this many times sooner than the timer would.
const WAKE_DIVISOR: u64 = 4;

/// Messages sent to the reclaimer task.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Message {
    /// Kill the entry off the request path.
    Teardown(EntryId),
    /// Usage crossed the soft watermark; run a pass soon.
    Wake,
    /// Stop the task.
    Shutdown,
}

/// What one reclamation pass achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Entries reclaimed.
    pub entries: usize,
    /// Directory chunks evicted.
    pub chunks: usize,
}

impl<B: Backend> CacheCore<B> {
    fn above_watermarks(&self) -> bool {
        self.counters.entries_used() > self.config.entries_hiwat
            || self.counters.chunks_used() > self.config.chunks_hiwat
    }

    /// Run one pass now, regardless of when the last one ran.
    pub(crate) fn run_pass(&self) -> PassReport {
        if self.is_shut_down() {
            return PassReport::default();
        }
        self.counters.begin_pass();
        let report = PassReport {
            entries: self.trim_entries(),
            chunks: self.trim_chunks(),
        };
        if report != PassReport::default() {
            debug!(
                entries = report.entries,
                chunks = report.chunks,
                entries_used = self.counters.entries_used(),
                chunks_used = self.counters.chunks_used(),
                "reclamation pass"
            );
        }
        report
    }

    /// Run a pass if at least `gap_ms` have gone by since the last one.
    pub(crate) fn maybe_run_pass(&self, gap_ms: u64) -> Option<PassReport> {
        self.counters.claim_pass(gap_ms).then(|| self.run_pass())
    }

    /// Bring `entries_used` down to `entries_hiwat`.
    ///
    /// The first round takes an even share of the excess from every lane. The second round lets
    /// each lane top up to `entries_release_size`, to cover lanes that had less to give than
    /// their share. Both rounds stop as soon as the watermark holds.
    fn trim_entries(&self) -> usize {
        let hiwat = self.config.entries_hiwat;
        let used = self.counters.entries_used();
        if used <= hiwat {
            self.counters.set_per_lane_work(0);
            return 0;
        }
        let release_size = u64::from(self.config.entries_release_size);
        let per_lane = (used - hiwat).div_ceil(LANES as u64).min(release_size);
        self.counters.set_per_lane_work(per_lane);

        let mut reclaimed = 0;
        for allowance in [per_lane, release_size - per_lane] {
            for lane in 0..LANES {
                let excess = self.counters.entries_used().saturating_sub(hiwat);
                if excess == 0 {
                    return reclaimed;
                }
                reclaimed += self.reap_lane(lane, quota(allowance, excess));
            }
        }

        let used = self.counters.entries_used();
        if used > hiwat {
            warn!(
                used,
                hiwat, reclaimed, "entries remain above the watermark, too few are reclaimable"
            );
        }
        reclaimed
    }

    /// Once `chunks_used` exceeds `chunks_hiwat`, trim it down to `chunks_lowat`.
    fn trim_chunks(&self) -> usize {
        let used = self.counters.chunks_used();
        if used <= self.config.chunks_hiwat {
            return 0;
        }
        let lowat = self.config.chunks_lowat;
        let per_lane = (used - lowat).div_ceil(LANES as u64);

        let mut evicted = 0;
        for allowance in [per_lane, u64::MAX] {
            for lane in 0..LANES {
                let excess = self.counters.chunks_used().saturating_sub(lowat);
                if excess == 0 {
                    return evicted;
                }
                let mut teardown = Teardown::default();
                let n = self
                    .lane(lane)
                    .reap_chunks(quota(allowance, excess), &mut teardown);
                self.counters.note_reclaimed(0, teardown.chunks_freed);
                self.finish(teardown);
                evicted += n;
            }
        }
        evicted
    }
}

fn quota(allowance: u64, excess: u64) -> usize {
    usize::try_from(allowance.min(excess)).unwrap_or(usize::MAX)
}

/// The reclaimer task.
struct Reclaimer<B: Backend> {
    core: Arc<CacheCore<B>>,
    receiver: Receiver<Message>,
    interval: Duration,
}

impl<B: Backend> Reclaimer<B> {
    async fn work(&mut self) {
        let mut tick = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = self.receiver.recv() => {
                    match msg {
                        Some(msg) => {
                            if !self.service_message(msg) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    // The engine handle is gone and only this task keeps the core alive.
                    if Arc::strong_count(&self.core) == 1 {
                        break;
                    }
                    self.core.maybe_run_pass(self.core.config.reclaim_interval_ms);
                }
            }
        }
        debug!("reclaimer stopped");
    }

    /// Returns true if the task should continue working.
    #[must_use]
    fn service_message(&mut self, message: Message) -> bool {
        match message {
            Message::Teardown(eid) => self.core.kill(eid),
            Message::Wake => {
                // Inserts wake the reclaimer early, but not more than a few times per interval.
                if self.core.above_watermarks() {
                    self.core
                        .maybe_run_pass(self.core.config.reclaim_interval_ms / WAKE_DIVISOR);
                }
            }
            Message::Shutdown => return false,
        }
        true
    }
}

/// Spawn the reclaimer for `core` on the current tokio runtime.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub(crate) fn spawn<B: Backend>(
    core: Arc<CacheCore<B>>,
    receiver: Receiver<Message>,
) -> JoinHandle<()> {
    let interval = core.config.reclaim_interval();
    info!(interval = ?interval, "starting reclaimer");
    tokio::spawn(async move {
        let mut task = Reclaimer {
            core,
            receiver,
            interval,
        };
        task.work().await;
    })
}
