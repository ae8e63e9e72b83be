//! The shared engine state and the entry lifecycle operations.
//!
//! Every operation locks at most one lane at a time and never holds a lane lock across an await
//! or a backend call. Anything that has to happen after a lane operation (counter updates,
//! cookie expiry, `Backend::forget`) is collected into a [`Teardown`] and finished once the lane
//! is unlocked.

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use super::counters::CacheCounters;
use super::lane::{EntryId, EntryInfo, LANES, LaneLengths, LaneState, QueueKind, Teardown};
use super::lane::{Entry, lane_of};
use super::populate::{AttrSlot, make_shared};
use super::reclaim::Message;
use super::refcount::{EntryState, RefCount, RefFlag, SENTINEL_REFCOUNT};
use super::store::SlotKey;
use crate::backend::Backend;
use crate::config::LruConfig;
use crate::dir::dirmap::DirMap;
use crate::error::{CacheError, Result, ref_violation};
use crate::sync::atomic::{AtomicBool, Ordering};
use crate::sync::{Mutex, MutexGuard, lock};

/// Engine state shared between the public handle, the reclaimer task, and deferred sends.
pub(crate) struct CacheCore<B: Backend> {
    pub(crate) backend: B,
    pub(crate) config: LruConfig,
    lanes: Box<[Mutex<LaneState<B>>]>,
    pub(crate) counters: CacheCounters,
    pub(crate) dirmap: DirMap,
    cleanup: mpsc::Sender<Message>,
    shut_down: AtomicBool,
}

/// Where a new entry goes and what reference the caller walks away with.
#[derive(Debug, Clone, Copy)]
struct Placement {
    queue: QueueKind,
    caller_ref: bool,
}

/// A caller reference taken while joining an in-flight populate. Released if the waiting future
/// is dropped before it settles.
struct HeldRef<'a, B: Backend> {
    core: &'a CacheCore<B>,
    eid: EntryId,
    armed: bool,
}

impl<B: Backend> HeldRef<'_, B> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<B: Backend> Drop for HeldRef<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            trace!(eid = ?self.eid, "populate waiter cancelled, releasing its reference");
            self.core.release(self.eid, RefFlag::Touch);
        }
    }
}

impl<B: Backend> CacheCore<B> {
    pub(crate) fn new(backend: B, config: LruConfig, cleanup: mpsc::Sender<Message>) -> Self {
        let lanes = (0..LANES)
            .map(|_| Mutex::new(LaneState::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let dirmap = DirMap::new(config.dirmap_hiwat);
        Self {
            backend,
            config,
            lanes,
            counters: CacheCounters::new(),
            dirmap,
            cleanup,
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn lane(&self, lane: usize) -> MutexGuard<'_, LaneState<B>> {
        lock(&self.lanes[lane])
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(CacheError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Finish the parts of a lane operation that must not run under the lane lock.
    pub(crate) fn finish(&self, teardown: Teardown<B::Id>) {
        if teardown.is_empty() {
            return;
        }
        self.counters
            .entries_removed(teardown.destroyed.len() as u64);
        self.counters.chunks_removed(teardown.chunks_freed);
        self.dirmap.forget(&teardown.cookies);
        for id in &teardown.destroyed {
            self.backend.forget(id);
        }
    }

    /// Stop the reclaimer, waiting for queue space if needed. A reclaimer that is already gone
    /// is fine.
    pub(crate) async fn stop_reclaimer(&self) {
        let _ = self.cleanup.send(Message::Shutdown).await;
    }

    /// Best-effort stop signal for contexts that cannot wait. If the queue is full the reclaimer
    /// notices on its next tick that it is the last owner of the core.
    pub(crate) fn signal_stop(&self) {
        let _ = self.cleanup.try_send(Message::Shutdown);
    }

    /// Ask the reclaimer for a pass if the soft watermark has been crossed.
    fn nudge_reclaimer(&self, used: u64) {
        if used > self.config.entries_hiwat {
            // A full queue already has a wake-up or teardown pending, either of which runs soon.
            let _ = self.cleanup.try_send(Message::Wake);
        }
    }

    pub(crate) async fn lookup_or_populate(&self, id: B::Id) -> Result<EntryId> {
        self.check_open()?;
        let lane = lane_of(&id);

        let mut retried = false;
        let (eid, pending, added) = loop {
            let attempt = {
                let mut st = self.lane(lane);
                if let Some(&key) = st.index.get(&id) {
                    let pending = st.entries.get_mut(key).map(|entry| {
                        entry.refs.acquire();
                        match &entry.attrs {
                            AttrSlot::Populating(fut) => Some(fut.clone()),
                            AttrSlot::Ready(_) => None,
                        }
                    });
                    // Only a hit on a populated entry is a second touch.
                    if matches!(pending, Some(None)) {
                        st.touch(key, RefFlag::Promote);
                    }
                    trace!(id = ?id, lane, "lookup hit");
                    pending.map(|p| (EntryId::new(lane, key), p, None))
                } else if let Some(used) = self
                    .counters
                    .try_reserve_entry(self.config.entries_hard_limit)
                {
                    let fetch = {
                        let backend = self.backend.clone();
                        let id = id.clone();
                        async move { backend.getattr(&id).await }
                    };
                    let fut = make_shared(fetch);
                    let entry = Entry::new(
                        id.clone(),
                        AttrSlot::Populating(fut.clone()),
                        RefCount::sentinel_and_caller(),
                    );
                    let key = st.insert(entry, QueueKind::Cold);
                    trace!(id = ?id, lane, slot = key.index(), "lookup miss, populating");
                    Some((EntryId::new(lane, key), Some(fut), Some(used)))
                } else {
                    None
                }
            };

            match attempt {
                Some(found) => break found,
                None if !retried => {
                    retried = true;
                    self.relieve_pressure();
                }
                None => return Err(self.no_space()),
            }
        };

        if let Some(used) = added {
            self.nudge_reclaimer(used);
        }

        let Some(fut) = pending else {
            return Ok(eid);
        };
        let held = HeldRef {
            core: self,
            eid,
            armed: true,
        };
        let outcome = fut.await;
        held.disarm();
        self.settle(eid, outcome)
    }

    /// Store the outcome of a populate on its entry, or kill the entry if the populate failed.
    /// The caller's reference is kept on success and dropped on failure.
    fn settle(&self, eid: EntryId, outcome: Result<B::Attrs>) -> Result<EntryId> {
        let mut teardown = Teardown::default();
        let mut violation = None;
        let result = {
            let mut st = self.lane(eid.lane());
            let key = eid.key();
            let zombie = st.entries.get(key).is_none_or(Entry::is_zombie);
            match outcome {
                Ok(attrs) if !zombie => {
                    if let Some(entry) = st.entries.get_mut(key)
                        && matches!(entry.attrs, AttrSlot::Populating(_))
                    {
                        trace!(id = ?entry.id, "populated entry");
                        entry.attrs = AttrSlot::Ready(attrs);
                    }
                    Ok(eid)
                }
                Ok(_) => {
                    violation =
                        Self::release_locked(&mut st, key, RefFlag::Touch, &mut teardown).err();
                    Err(CacheError::Stale)
                }
                Err(err) => {
                    if st.kill(key, &mut teardown) {
                        debug!(eid = ?eid, error = %err, "populate failed, killed entry");
                    }
                    violation =
                        Self::release_locked(&mut st, key, RefFlag::Touch, &mut teardown).err();
                    Err(err)
                }
            }
        };
        if let Some(what) = violation {
            ref_violation(what, &eid);
        }
        self.finish(teardown);
        result
    }

    fn no_space(&self) -> CacheError {
        let used = self.counters.entries_used();
        warn!(
            used,
            limit = self.config.entries_hard_limit,
            "entry store exhausted after forced release"
        );
        CacheError::NoSpace { used }
    }

    /// One synchronous forced release of `entries_release_size` entries.
    fn relieve_pressure(&self) {
        let want = self.config.entries_release_size as usize;
        let released = self.release_entries(want);
        debug!(want, released, "entry store at hard limit, forced a release");
    }

    /// Index `id` with known attributes. Returns the existing entry if one is already indexed,
    /// refreshing its attributes.
    fn index_with(
        &self,
        id: B::Id,
        attrs: B::Attrs,
        placement: Placement,
        relieve: bool,
    ) -> Result<Option<EntryId>> {
        self.check_open()?;
        let lane = lane_of(&id);
        let mut retried = !relieve;
        loop {
            let created = {
                let mut st = self.lane(lane);
                if let Some(&key) = st.index.get(&id) {
                    if let Some(entry) = st.entries.get_mut(key) {
                        entry.attrs = AttrSlot::Ready(attrs);
                        if placement.caller_ref {
                            entry.refs.acquire();
                        }
                    }
                    if placement.queue == QueueKind::Warm {
                        st.promote(key);
                    }
                    return Ok(Some(EntryId::new(lane, key)));
                }
                self.counters
                    .try_reserve_entry(self.config.entries_hard_limit)
                    .map(|used| {
                        let refs = if placement.caller_ref {
                            RefCount::sentinel_and_caller()
                        } else {
                            RefCount::sentinel()
                        };
                        let entry = Entry::new(id.clone(), AttrSlot::Ready(attrs.clone()), refs);
                        let key = st.insert(entry, placement.queue);
                        trace!(id = ?id, lane, queue = ?placement.queue, "inserted entry");
                        (EntryId::new(lane, key), used)
                    })
            };
            match created {
                Some((eid, used)) => {
                    self.nudge_reclaimer(used);
                    return Ok(Some(eid));
                }
                None if !retried => {
                    retried = true;
                    self.relieve_pressure();
                }
                None if relieve => return Err(self.no_space()),
                None => return Ok(None),
            }
        }
    }

    pub(crate) fn insert_active(&self, id: B::Id, attrs: B::Attrs) -> Result<EntryId> {
        let placement = Placement {
            queue: QueueKind::Warm,
            caller_ref: true,
        };
        self.index_with(id, attrs, placement, true)?
            .ok_or_else(|| self.no_space())
    }

    pub(crate) fn lookup_or_insert(&self, id: B::Id, attrs: B::Attrs) -> Result<EntryId> {
        let placement = Placement {
            queue: QueueKind::Cold,
            caller_ref: true,
        };
        self.index_with(id, attrs, placement, true)?
            .ok_or_else(|| self.no_space())
    }

    /// Index a directory-listing target without taking a reference or calling the backend.
    /// Returns `None` when the store is full; listings never force a release.
    pub(crate) fn ensure_indexed(&self, id: B::Id, attrs: B::Attrs) -> Option<EntryId> {
        let placement = Placement {
            queue: QueueKind::Cold,
            caller_ref: false,
        };
        self.index_with(id, attrs, placement, false).ok().flatten()
    }

    pub(crate) fn acquire(&self, eid: EntryId, flag: RefFlag) -> Result<()> {
        self.check_open()?;
        let mut st = self.lane(eid.lane());
        let entry = st.live_mut(eid.key()).ok_or(CacheError::Stale)?;
        entry.refs.acquire();
        trace!(eid = ?eid, refs = entry.refs.get(), flag = ?flag, "acquired reference");
        st.touch(eid.key(), flag);
        Ok(())
    }

    /// Drop one reference of kind `flag` with the lane already locked. A temporary borrow going
    /// back to the sentinel leaves the entry where it was.
    ///
    /// Returns a description of the violation if the release was not matched by an acquire. The
    /// lane state is left as it was in that case.
    fn release_locked(
        st: &mut LaneState<B>,
        key: SlotKey,
        flag: RefFlag,
        teardown: &mut Teardown<B::Id>,
    ) -> std::result::Result<(), &'static str> {
        let Some(entry) = st.entries.get_mut(key) else {
            return Err("release of a destroyed entry");
        };
        let zombie = entry.is_zombie();
        match entry.refs.release() {
            None => Err("release below zero"),
            Some(0) if zombie => {
                st.destroy_zombie(key, teardown);
                Ok(())
            }
            Some(0) => {
                entry.refs.acquire();
                Err("release of the index sentinel")
            }
            Some(SENTINEL_REFCOUNT) if !zombie && flag != RefFlag::TemporaryBorrow => {
                st.demote_candidate(key);
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    pub(crate) fn release(&self, eid: EntryId, flag: RefFlag) {
        if self.is_shut_down() {
            return;
        }
        let mut teardown = Teardown::default();
        let outcome = {
            let mut st = self.lane(eid.lane());
            Self::release_locked(&mut st, eid.key(), flag, &mut teardown)
        };
        match outcome {
            Ok(()) => trace!(eid = ?eid, flag = ?flag, "released reference"),
            Err(what) => ref_violation(what, &eid),
        }
        self.finish(teardown);
    }

    pub(crate) fn promote(&self, eid: EntryId) -> Result<()> {
        self.check_open()?;
        let mut st = self.lane(eid.lane());
        if st.live(eid.key()).is_none() {
            return Err(CacheError::Stale);
        }
        st.promote(eid.key());
        Ok(())
    }

    pub(crate) fn pin(&self, eid: EntryId) -> Result<()> {
        self.check_open()?;
        let mut st = self.lane(eid.lane());
        if st.live(eid.key()).is_none() {
            return Err(CacheError::Stale);
        }
        st.pin(eid.key());
        trace!(eid = ?eid, "pinned entry");
        Ok(())
    }

    pub(crate) fn unpin(&self, eid: EntryId) {
        if self.is_shut_down() {
            return;
        }
        let unpinned = {
            let mut st = self.lane(eid.lane());
            let pinned = st.entries.get(eid.key()).is_some_and(|e| e.pins > 0);
            if pinned {
                st.unpin(eid.key());
            }
            pinned
        };
        if unpinned {
            trace!(eid = ?eid, "unpinned entry");
        } else {
            ref_violation("unpin without a matching pin", &eid);
        }
    }

    pub(crate) fn kill(&self, eid: EntryId) {
        if self.is_shut_down() {
            return;
        }
        let mut teardown = Teardown::default();
        let killed = self.lane(eid.lane()).kill(eid.key(), &mut teardown);
        if !killed {
            trace!(eid = ?eid, "kill of an entry that is already dead");
        }
        self.finish(teardown);
    }

    pub(crate) fn deferred_release(&self, eid: EntryId) {
        match self.cleanup.try_send(Message::Teardown(eid)) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let sender = self.cleanup.clone();
                    handle.spawn(async move {
                        let _ = sender.send(msg).await;
                    });
                } else {
                    self.kill(eid);
                }
            }
            Err(TrySendError::Closed(_)) => self.kill(eid),
        }
    }

    pub(crate) fn try_deferred_release(&self, eid: EntryId) -> bool {
        if self.is_shut_down() {
            return false;
        }
        let live = match self.lanes[eid.lane()].try_lock() {
            Ok(st) => st.live(eid.key()).is_some(),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().live(eid.key()).is_some()
            }
            Err(std::sync::TryLockError::WouldBlock) => return false,
        };
        live && self.cleanup.try_send(Message::Teardown(eid)).is_ok()
    }

    pub(crate) fn attrs(&self, eid: EntryId) -> Result<B::Attrs> {
        self.check_open()?;
        let st = self.lane(eid.lane());
        st.live(eid.key())
            .and_then(|e| e.attrs.ready().cloned())
            .ok_or(CacheError::Stale)
    }

    pub(crate) fn identity(&self, eid: EntryId) -> Result<B::Id> {
        self.check_open()?;
        let st = self.lane(eid.lane());
        st.live(eid.key())
            .map(|e| e.id.clone())
            .ok_or(CacheError::Stale)
    }

    pub(crate) fn inspect(&self, eid: EntryId) -> Result<EntryInfo> {
        self.check_open()?;
        let st = self.lane(eid.lane());
        st.entries
            .get(eid.key())
            .map(Entry::info)
            .ok_or(CacheError::Stale)
    }

    pub(crate) fn state(&self, eid: EntryId) -> Result<EntryState> {
        self.inspect(eid).map(|info| info.state)
    }

    /// Reclaim up to `quota` entries from one lane.
    pub(crate) fn reap_lane(&self, lane: usize, quota: usize) -> usize {
        if quota == 0 {
            return 0;
        }
        let mut teardown = Teardown::default();
        let reclaimed = self.lane(lane).reap(quota, &mut teardown);
        self.counters
            .note_reclaimed(reclaimed as u64, teardown.chunks_freed);
        self.finish(teardown);
        reclaimed
    }

    /// Synchronous forced release: visit every lane at most once, round-robin from a rotating
    /// start, taking at most `entries_release_size` from each.
    pub(crate) fn release_entries(&self, want: usize) -> usize {
        if want == 0 || self.is_shut_down() {
            return 0;
        }
        let per_lane = self.config.entries_release_size as usize;
        let start = self.counters.next_lane_cursor();
        let mut released = 0;
        for step in 0..LANES {
            let remaining = want - released;
            if remaining == 0 {
                break;
            }
            released += self.reap_lane((start + step) % LANES, per_lane.min(remaining));
        }
        debug!(want, released, "forced release");
        released
    }

    pub(crate) fn lane_lengths(&self) -> Vec<LaneLengths> {
        (0..LANES).map(|lane| self.lane(lane).lengths()).collect()
    }

    /// Flip the engine into the shut-down state. Returns `false` if it already was.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shut_down.swap(true, Ordering::AcqRel)
    }

    /// Free every entry and chunk, ignoring references and pins.
    pub(crate) fn drain(&self) -> usize {
        let mut destroyed = 0;
        for lane in 0..LANES {
            let mut teardown = Teardown::default();
            self.lane(lane).drain(&mut teardown);
            destroyed += teardown.destroyed.len();
            self.finish(teardown);
        }
        self.dirmap.clear();
        destroyed
    }
}
