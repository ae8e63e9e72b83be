//! Lane-sharded entry state.
//!
//! The entry population is split across [`LANES`] independent lanes. Each lane owns an arena of
//! entries, the slice of the identity index for identities hashed to it, and three queues:
//!
//! - **cold**: first-touch entries, in insertion order. Reclamation starts at its tail.
//! - **warm**: entries that proved reuse, in approximate LRU order.
//! - **pinned**: entries backing open or lock state, never scanned for reclamation.
//!
//! Killed entries (zombies) stay in the arena, on no queue, until their last holder releases.
//! Directory chunks owned by a lane's entries live in the same lane, on a separate full-LRU
//! queue.
//!
//! Nothing here calls into the backend or takes another lock. Work that must happen after the
//! lane lock is dropped is returned as a [`Teardown`].

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};

use super::list::{Link, Linked, SubList};
use super::populate::AttrSlot;
use super::refcount::{EntryState, RefCount, RefFlag, SENTINEL_REFCOUNT};
use super::store::{SlotKey, Store};
use crate::backend::{Backend, ObjectAttrs as _, ObjectKind};
use crate::dir::chunk::Chunk;

/// Number of lanes. Prime, so identity hashes that share a factor with the lane count do not pile
/// up in a few lanes.
pub const LANES: usize = 17;

/// How many queue positions a reaper may inspect per entry it is asked to reclaim. Bounds the
/// work done when the tail of a queue is crowded with referenced entries.
const SCAN_FACTOR: usize = 8;

/// The lane an identity belongs to. Stable for the life of the process.
#[must_use]
pub fn lane_of<I: Hash + ?Sized>(id: &I) -> usize {
    let mut hasher = FxHasher::default();
    id.hash(&mut hasher);
    #[expect(
        clippy::cast_possible_truncation,
        reason = "the remainder is below LANES"
    )]
    let lane = (hasher.finish() % LANES as u64) as usize;
    lane
}

/// Handle to a cache entry.
///
/// Handles are plain values: holding one does not keep the entry alive. Take a reference with
/// [`acquire`](crate::HandleCache::acquire) (or get one from a lookup) to do that. Once the entry
/// is destroyed, operations on the handle report [`Stale`](crate::CacheError::Stale), even if
/// its arena slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    lane: u8,
    key: SlotKey,
}

impl EntryId {
    pub(crate) fn new(lane: usize, key: SlotKey) -> Self {
        #[expect(clippy::cast_possible_truncation, reason = "lane is below LANES")]
        let lane = lane as u8;
        Self { lane, key }
    }

    /// The lane this entry lives in.
    #[must_use]
    pub fn lane(self) -> usize {
        usize::from(self.lane)
    }

    pub(crate) fn key(self) -> SlotKey {
        self.key
    }
}

/// Which queue an entry currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// First-touch queue.
    Cold,
    /// Proven-reuse queue.
    Warm,
    /// Exempt from reclamation.
    Pinned,
    /// On no queue; the entry has been killed.
    Detached,
}

/// A point-in-time view of one entry, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Lifecycle state.
    pub state: EntryState,
    /// Reference count, including the index sentinel while the entry is indexed.
    pub refs: u32,
    /// Number of open/lock states pinning the entry.
    pub pins: u32,
    /// Queue membership.
    pub queue: QueueKind,
    /// Number of directory chunks attached to the entry.
    pub chunks: usize,
}

/// Per-lane queue lengths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneLengths {
    /// Entries on the cold queue.
    pub cold: usize,
    /// Entries on the warm queue.
    pub warm: usize,
    /// Entries on the pinned queue.
    pub pinned: usize,
    /// Every entry resident in the lane's arena, zombies included.
    pub resident: usize,
    /// Directory chunks resident in the lane.
    pub chunks: usize,
}

/// One cached backend object.
pub(crate) struct Entry<B: Backend> {
    pub(crate) id: B::Id,
    pub(crate) attrs: AttrSlot<B::Attrs>,
    pub(crate) refs: RefCount,
    pub(crate) pins: u32,
    pub(crate) queue: QueueKind,
    /// Chunks of this directory, keyed by the resume position they start at.
    pub(crate) chunks: BTreeMap<u64, SlotKey>,
    link: Link,
}

impl<B: Backend> Entry<B> {
    pub(crate) fn new(id: B::Id, attrs: AttrSlot<B::Attrs>, refs: RefCount) -> Self {
        Self {
            id,
            attrs,
            refs,
            pins: 0,
            queue: QueueKind::Detached,
            chunks: BTreeMap::new(),
            link: Link::default(),
        }
    }

    pub(crate) fn is_zombie(&self) -> bool {
        self.queue == QueueKind::Detached
    }

    pub(crate) fn kind(&self) -> Option<ObjectKind> {
        self.attrs.ready().map(|attrs| attrs.kind())
    }

    fn is_evictable(&self) -> bool {
        self.refs.get() == SENTINEL_REFCOUNT
            && self.pins == 0
            && matches!(self.queue, QueueKind::Cold | QueueKind::Warm)
    }

    pub(crate) fn info(&self) -> EntryInfo {
        let state = if self.is_zombie() {
            EntryState::Zombie
        } else if self.pins > 0 {
            EntryState::Pinned
        } else if self.refs.is_active() {
            EntryState::Active
        } else {
            EntryState::Unreferenced
        };
        EntryInfo {
            state,
            refs: self.refs.get(),
            pins: self.pins,
            queue: self.queue,
            chunks: self.chunks.len(),
        }
    }
}

impl<B: Backend> Linked for Entry<B> {
    fn link(&self) -> &Link {
        &self.link
    }

    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// Work left over after a lane operation, to be finished once the lane lock is released.
#[derive(Debug)]
pub(crate) struct Teardown<I> {
    /// Chunks that left the cache.
    pub(crate) chunks_freed: u64,
    /// Cookies those chunks issued.
    pub(crate) cookies: Vec<u64>,
    /// Identities of entries that were physically destroyed.
    pub(crate) destroyed: Vec<I>,
}

impl<I> Default for Teardown<I> {
    fn default() -> Self {
        Self {
            chunks_freed: 0,
            cookies: Vec::new(),
            destroyed: Vec::new(),
        }
    }
}

impl<I> Teardown<I> {
    pub(crate) fn is_empty(&self) -> bool {
        self.chunks_freed == 0 && self.cookies.is_empty() && self.destroyed.is_empty()
    }
}

/// Everything guarded by one lane lock.
pub(crate) struct LaneState<B: Backend> {
    pub(crate) index: FxHashMap<B::Id, SlotKey>,
    pub(crate) entries: Store<Entry<B>>,
    pub(crate) cold: SubList,
    pub(crate) warm: SubList,
    pub(crate) pinned: SubList,
    pub(crate) chunks: Store<Chunk<B>>,
    pub(crate) chunk_lru: SubList,
}

impl<B: Backend> Default for LaneState<B> {
    fn default() -> Self {
        Self {
            index: FxHashMap::default(),
            entries: Store::new(),
            cold: SubList::default(),
            warm: SubList::default(),
            pinned: SubList::default(),
            chunks: Store::new(),
            chunk_lru: SubList::default(),
        }
    }
}

impl<B: Backend> LaneState<B> {
    /// Resolve `key` to an entry that is still indexed.
    pub(crate) fn live(&self, key: SlotKey) -> Option<&Entry<B>> {
        self.entries.get(key).filter(|e| !e.is_zombie())
    }

    /// Mutable variant of [`live`](Self::live).
    pub(crate) fn live_mut(&mut self, key: SlotKey) -> Option<&mut Entry<B>> {
        self.entries.get_mut(key).filter(|e| !e.is_zombie())
    }

    pub(crate) fn lengths(&self) -> LaneLengths {
        LaneLengths {
            cold: self.cold.len(),
            warm: self.warm.len(),
            pinned: self.pinned.len(),
            resident: self.entries.len(),
            chunks: self.chunks.len(),
        }
    }

    fn list(&self, queue: QueueKind) -> Option<&SubList> {
        match queue {
            QueueKind::Cold => Some(&self.cold),
            QueueKind::Warm => Some(&self.warm),
            QueueKind::Pinned => Some(&self.pinned),
            QueueKind::Detached => None,
        }
    }

    /// Index `entry` and queue it at the head of `queue`.
    pub(crate) fn insert(&mut self, entry: Entry<B>, queue: QueueKind) -> SlotKey {
        let id = entry.id.clone();
        let key = self.entries.insert(entry);
        self.index.insert(id, key);
        self.enqueue(key, queue, true);
        key
    }

    fn enqueue(&mut self, key: SlotKey, queue: QueueKind, at_head: bool) {
        let list = match queue {
            QueueKind::Cold => &mut self.cold,
            QueueKind::Warm => &mut self.warm,
            QueueKind::Pinned => &mut self.pinned,
            QueueKind::Detached => return,
        };
        if at_head {
            list.push_head(&mut self.entries, key);
        } else {
            list.push_tail(&mut self.entries, key);
        }
        if let Some(entry) = self.entries.get_mut(key) {
            entry.queue = queue;
        }
    }

    /// Take `key` off whatever queue it is on.
    fn detach(&mut self, key: SlotKey) {
        let Some(queue) = self.entries.get(key).map(|e| e.queue) else {
            return;
        };
        match queue {
            QueueKind::Cold => self.cold.unlink(&mut self.entries, key),
            QueueKind::Warm => self.warm.unlink(&mut self.entries, key),
            QueueKind::Pinned => self.pinned.unlink(&mut self.entries, key),
            QueueKind::Detached => {}
        }
        if let Some(entry) = self.entries.get_mut(key) {
            entry.queue = QueueKind::Detached;
        }
    }

    /// Move a cold entry to the warm head, or refresh a warm one. Pinned and killed entries keep
    /// their place.
    pub(crate) fn promote(&mut self, key: SlotKey) {
        match self.entries.get(key).map(|e| e.queue) {
            Some(QueueKind::Cold) => {
                self.cold.unlink(&mut self.entries, key);
                self.enqueue(key, QueueKind::Warm, true);
                tracing::trace!(slot = key.index(), "promoted cold entry to warm");
            }
            Some(QueueKind::Warm) => self.warm.move_to_head(&mut self.entries, key),
            _ => {}
        }
    }

    /// Apply the queue side effect of a reference of kind `flag`.
    pub(crate) fn touch(&mut self, key: SlotKey, flag: RefFlag) {
        match flag {
            RefFlag::Promote => self.promote(key),
            RefFlag::Touch => {
                if self.entries.get(key).map(|e| e.queue) == Some(QueueKind::Warm) {
                    self.warm.move_to_head(&mut self.entries, key);
                }
            }
            RefFlag::TemporaryBorrow => {}
        }
    }

    /// A live entry dropped back to the sentinel: make it the next cold candidate. Warm entries
    /// keep the position they earned.
    pub(crate) fn demote_candidate(&mut self, key: SlotKey) {
        if self.entries.get(key).map(|e| e.queue) == Some(QueueKind::Cold) {
            self.cold.move_to_tail(&mut self.entries, key);
        }
    }

    /// Register one more open/lock state on `key`. The first one moves it to the pinned queue.
    pub(crate) fn pin(&mut self, key: SlotKey) {
        let Some(entry) = self.live_mut(key) else {
            return;
        };
        entry.pins += 1;
        if entry.pins == 1 {
            self.detach(key);
            self.enqueue(key, QueueKind::Pinned, true);
        }
    }

    /// Drop one pin. The last one returns a live entry to the cold head: holding state is no
    /// evidence of cache-hit value.
    pub(crate) fn unpin(&mut self, key: SlotKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.pins = entry.pins.saturating_sub(1);
        if entry.pins == 0 && entry.queue == QueueKind::Pinned {
            self.pinned.unlink(&mut self.entries, key);
            self.enqueue(key, QueueKind::Cold, true);
        }
    }

    /// Make `key` unreachable: drop it from the index, take it off its queue, and free its
    /// chunks. Reference counts are not touched.
    fn unindex(&mut self, key: SlotKey, teardown: &mut Teardown<B::Id>) {
        let Some(entry) = self.live(key) else {
            return;
        };
        if self.index.get(&entry.id) == Some(&key) {
            let id = entry.id.clone();
            self.index.remove(&id);
        }
        self.detach(key);
        self.drop_chunks(key, teardown);
    }

    /// Physically free `key`. Only valid once it has left the index.
    fn destroy(&mut self, key: SlotKey, teardown: &mut Teardown<B::Id>) {
        self.drop_chunks(key, teardown);
        if let Some(entry) = self.entries.remove(key) {
            tracing::trace!(id = ?entry.id, slot = key.index(), "destroyed cache entry");
            teardown.destroyed.push(entry.id);
        }
    }

    /// Kill `key`: unindex it and drop the sentinel reference. Destroys it immediately when no
    /// caller holds it. Returns `false` if the entry was already a zombie or gone.
    pub(crate) fn kill(&mut self, key: SlotKey, teardown: &mut Teardown<B::Id>) -> bool {
        if self.live(key).is_none() {
            return false;
        }
        self.unindex(key, teardown);
        let remaining = self.entries.get_mut(key).and_then(|e| e.refs.release());
        tracing::trace!(slot = key.index(), remaining = ?remaining, "killed cache entry");
        if remaining == Some(0) {
            self.destroy(key, teardown);
        }
        true
    }

    /// Drop the last reference of a zombie.
    pub(crate) fn destroy_zombie(&mut self, key: SlotKey, teardown: &mut Teardown<B::Id>) {
        self.destroy(key, teardown);
    }

    /// Reclaim up to `quota` unreferenced, unpinned entries, cold tail first and warm tail only
    /// once cold has nothing left to give. Directories with a referenced chunk are skipped.
    pub(crate) fn reap(&mut self, quota: usize, teardown: &mut Teardown<B::Id>) -> usize {
        let budget = quota.saturating_mul(SCAN_FACTOR);
        let mut reclaimed = 0;
        for queue in [QueueKind::Cold, QueueKind::Warm] {
            let mut cursor = self.list(queue).and_then(SubList::tail);
            let mut scanned = 0;
            while let Some(key) = cursor {
                if reclaimed >= quota || scanned >= budget {
                    break;
                }
                scanned += 1;
                cursor = SubList::towards_head(&self.entries, key);
                if self.entries.get(key).is_some_and(Entry::is_evictable)
                    && !self.holds_referenced_chunk(key)
                {
                    self.kill(key, teardown);
                    reclaimed += 1;
                }
            }
            if reclaimed >= quota {
                break;
            }
        }
        reclaimed
    }

    /// Whether a caller still holds one of directory `key`'s chunks. Such a directory is only
    /// freed by an explicit kill.
    fn holds_referenced_chunk(&self, key: SlotKey) -> bool {
        self.entries.get(key).is_some_and(|entry| {
            entry
                .chunks
                .values()
                .any(|&chunk| self.chunks.get(chunk).is_some_and(|c| c.refs > 0))
        })
    }

    /// Free every chunk of directory `key`.
    fn drop_chunks(&mut self, key: SlotKey, teardown: &mut Teardown<B::Id>) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let chunks = std::mem::take(&mut entry.chunks);
        for chunk_key in chunks.into_values() {
            self.free_chunk(chunk_key, teardown);
        }
    }

    /// Unlink and free one chunk. The parent's chunk map must already have been updated.
    fn free_chunk(&mut self, chunk_key: SlotKey, teardown: &mut Teardown<B::Id>) {
        if !self.chunks.contains(chunk_key) {
            return;
        }
        self.chunk_lru.unlink(&mut self.chunks, chunk_key);
        if let Some(chunk) = self.chunks.remove(chunk_key) {
            teardown.chunks_freed += 1;
            teardown.cookies.extend(chunk.cookies.iter().flatten());
        }
    }

    /// Evict one chunk, detaching it from its parent directory first.
    pub(crate) fn evict_chunk(&mut self, chunk_key: SlotKey, teardown: &mut Teardown<B::Id>) {
        let Some(chunk) = self.chunks.get(chunk_key) else {
            return;
        };
        let (parent, start) = (chunk.parent, chunk.start);
        if let Some(entry) = self.entries.get_mut(parent)
            && entry.chunks.get(&start) == Some(&chunk_key)
        {
            entry.chunks.remove(&start);
        }
        self.free_chunk(chunk_key, teardown);
    }

    /// Evict up to `quota` unreferenced chunks from the LRU end of the chunk queue.
    pub(crate) fn reap_chunks(&mut self, quota: usize, teardown: &mut Teardown<B::Id>) -> usize {
        let budget = quota.saturating_mul(SCAN_FACTOR);
        let mut evicted = 0;
        let mut scanned = 0;
        let mut cursor = self.chunk_lru.tail();
        while let Some(chunk_key) = cursor {
            if evicted >= quota || scanned >= budget {
                break;
            }
            scanned += 1;
            cursor = SubList::towards_head(&self.chunks, chunk_key);
            if self.chunks.get(chunk_key).is_some_and(|c| c.refs == 0) {
                self.evict_chunk(chunk_key, teardown);
                evicted += 1;
            }
        }
        evicted
    }

    /// Forcibly free everything in the lane, ignoring references and pins.
    pub(crate) fn drain(&mut self, teardown: &mut Teardown<B::Id>) {
        self.index.clear();
        self.cold.clear();
        self.warm.clear();
        self.pinned.clear();
        self.chunk_lru.clear();
        for chunk in self.chunks.drain() {
            teardown.chunks_freed += 1;
            teardown.cookies.extend(chunk.cookies.iter().flatten());
        }
        for entry in self.entries.drain() {
            teardown.destroyed.push(entry.id);
        }
    }
}
