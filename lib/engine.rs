//! The public engine handle.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::cache::core::CacheCore;
use crate::cache::reclaim;
use crate::cache::{CacheStats, EntryId, EntryInfo, EntryState, LaneLengths, PassReport, RefFlag};
use crate::config::{ConfigError, LruConfig};
use crate::dir::{ChunkId, ChunkRef, MappedDirent};
use crate::error::Result;
use crate::sync::{Arc, Mutex, lock};

/// An object-handle cache in front of a [`Backend`].
///
/// Entry handles ([`EntryId`]) come back from [`lookup_or_populate`](Self::lookup_or_populate),
/// [`insert_active`](Self::insert_active), and [`lookup_or_insert`](Self::lookup_or_insert)
/// with one reference already taken on behalf of the caller. Every reference must eventually be
/// handed back through [`release`](Self::release).
///
/// The handle is not `Clone`; share it behind an [`Arc`]. Dropping it stops the background
/// reclaimer but does not drain the cache; call [`shutdown`](Self::shutdown) for that.
pub struct HandleCache<B: Backend> {
    core: Arc<CacheCore<B>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> std::fmt::Debug for HandleCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> HandleCache<B> {
    /// Validate `config` and start the engine, spawning its reclaimer on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(backend: B, config: LruConfig) -> std::result::Result<Self, ConfigError> {
        config.validate().map_err(ConfigError::ValidationErrors)?;
        let (tx, rx) = mpsc::channel(config.cleanup_queue_depth);
        let core = Arc::new(CacheCore::new(backend, config, tx));
        let worker = reclaim::spawn(Arc::clone(&core), rx);
        info!(
            entries_hiwat = core.config.entries_hiwat,
            chunks_hiwat = core.config.chunks_hiwat,
            "handle cache started"
        );
        Ok(Self {
            core,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The configuration the engine runs with.
    #[must_use]
    pub fn config(&self) -> &LruConfig {
        &self.core.config
    }

    /// The backend the engine fronts.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.core.backend
    }

    /// Find the entry for `id`, populating it from the backend on a miss.
    ///
    /// Concurrent misses for one identity share a single backend call and all receive the same
    /// entry. A hit on a populated entry counts as a second touch and promotes it to warm. If
    /// the entry store is at its hard limit, one forced release is run and the allocation
    /// retried once.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the populate failed (the half-built entry is killed),
    /// [`Stale`](crate::CacheError::Stale) if the entry was killed while it was populating, and
    /// [`NoSpace`](crate::CacheError::NoSpace) if no room could be made.
    pub async fn lookup_or_populate(&self, id: B::Id) -> Result<EntryId> {
        self.core.lookup_or_populate(id).await
    }

    /// Insert an entry known to be hot directly on the warm queue, with attributes the caller
    /// already has. Returns the existing entry, refreshed and promoted, if `id` is cached.
    ///
    /// # Errors
    ///
    /// [`NoSpace`](crate::CacheError::NoSpace) or [`ShutDown`](crate::CacheError::ShutDown).
    pub fn insert_active(&self, id: B::Id, attrs: B::Attrs) -> Result<EntryId> {
        self.core.insert_active(id, attrs)
    }

    /// Like [`insert_active`](Self::insert_active), but a new entry starts cold.
    ///
    /// # Errors
    ///
    /// [`NoSpace`](crate::CacheError::NoSpace) or [`ShutDown`](crate::CacheError::ShutDown).
    pub fn lookup_or_insert(&self, id: B::Id, attrs: B::Attrs) -> Result<EntryId> {
        self.core.lookup_or_insert(id, attrs)
    }

    /// Take a reference on `eid`.
    ///
    /// # Errors
    ///
    /// [`Stale`](crate::CacheError::Stale) if the entry has been killed or destroyed.
    pub fn acquire(&self, eid: EntryId, flag: RefFlag) -> Result<()> {
        self.core.acquire(eid, flag)
    }

    /// Hand back a reference.
    ///
    /// Dropping to the index sentinel makes a cold entry the next reclamation candidate of its
    /// lane. Dropping the last reference of a killed entry destroys it.
    pub fn release(&self, eid: EntryId) {
        self.core.release(eid, RefFlag::Touch);
    }

    /// Hand back a reference taken with [`RefFlag::TemporaryBorrow`].
    ///
    /// The entry keeps its queue position even when it drops back to the index sentinel.
    pub fn release_borrow(&self, eid: EntryId) {
        self.core.release(eid, RefFlag::TemporaryBorrow);
    }

    /// Move a cold entry to the warm queue.
    ///
    /// # Errors
    ///
    /// [`Stale`](crate::CacheError::Stale) if the entry has been killed or destroyed.
    pub fn promote(&self, eid: EntryId) -> Result<()> {
        self.core.promote(eid)
    }

    /// Register open or lock state on `eid`, exempting it from reclamation.
    ///
    /// # Errors
    ///
    /// [`Stale`](crate::CacheError::Stale) if the entry has been killed or destroyed.
    pub fn pin(&self, eid: EntryId) -> Result<()> {
        self.core.pin(eid)
    }

    /// Release one pin. The last one returns the entry to the cold head.
    pub fn unpin(&self, eid: EntryId) {
        self.core.unpin(eid);
    }

    /// Remove `eid` from the index regardless of references. Holders keep a handle that reports
    /// [`Stale`](crate::CacheError::Stale); the entry is destroyed on the last release.
    pub fn kill(&self, eid: EntryId) {
        self.core.kill(eid);
    }

    /// Kill `eid` on the reclaimer instead of inline.
    ///
    /// Falls back to a spawned send when the teardown queue is full, and to an inline kill when
    /// the reclaimer is gone.
    pub fn deferred_release(&self, eid: EntryId) {
        self.core.deferred_release(eid);
    }

    /// Non-blocking variant of [`deferred_release`](Self::deferred_release).
    ///
    /// Returns `false` without doing anything if the entry's lane is contended, the entry is no
    /// longer live, or the teardown queue is full. The caller may retry later or kill inline.
    #[must_use]
    pub fn try_deferred_release(&self, eid: EntryId) -> bool {
        self.core.try_deferred_release(eid)
    }

    /// Synchronously reclaim up to `want` unreferenced, unpinned entries. Returns how many were
    /// reclaimed, which may be fewer.
    pub fn release_entries(&self, want: usize) -> usize {
        self.core.release_entries(want)
    }

    /// Run one background reclamation pass now.
    pub fn run_reclaim_pass(&self) -> PassReport {
        self.core.run_pass()
    }

    /// The entry's attributes.
    ///
    /// # Errors
    ///
    /// [`Stale`](crate::CacheError::Stale) if the entry has been killed or destroyed.
    pub fn attrs(&self, eid: EntryId) -> Result<B::Attrs> {
        self.core.attrs(eid)
    }

    /// The entry's backend identity.
    ///
    /// # Errors
    ///
    /// [`Stale`](crate::CacheError::Stale) if the entry has been killed or destroyed.
    pub fn identity(&self, eid: EntryId) -> Result<B::Id> {
        self.core.identity(eid)
    }

    /// The entry's lifecycle state. Zombies report [`EntryState::Zombie`] until destroyed.
    ///
    /// # Errors
    ///
    /// [`Stale`](crate::CacheError::Stale) once the entry has been destroyed.
    pub fn state(&self, eid: EntryId) -> Result<EntryState> {
        self.core.state(eid)
    }

    /// Reference count, pins, and queue membership of `eid`.
    ///
    /// # Errors
    ///
    /// [`Stale`](crate::CacheError::Stale) once the entry has been destroyed.
    pub fn inspect(&self, eid: EntryId) -> Result<EntryInfo> {
        self.core.inspect(eid)
    }

    /// Fetch the chunk of directory `parent` covering `whence`.
    ///
    /// The caller's reference on `prev` is transferred to the returned chunk. If `prev` already
    /// covers `whence` it is returned as is, without a backend call. On error the caller keeps
    /// its reference on `prev`.
    ///
    /// # Errors
    ///
    /// [`Stale`](crate::CacheError::Stale) if the directory is gone,
    /// [`NotADirectory`](crate::CacheError::NotADirectory), or the backend's readdir error.
    pub async fn get_chunk(
        &self,
        parent: EntryId,
        prev: Option<ChunkId>,
        whence: u64,
    ) -> Result<ChunkRef<B::Id>> {
        self.core.get_chunk(parent, prev, whence).await
    }

    /// Mark a chunk as recently used.
    pub fn bump_chunk(&self, chunk: ChunkId) {
        self.core.bump_chunk(chunk);
    }

    /// Drop a chunk reference.
    pub fn release_chunk(&self, chunk: ChunkId) {
        self.core.release_chunk(chunk);
    }

    /// Issue a resume cookie for dirent `index` of `chunk`.
    ///
    /// # Errors
    ///
    /// [`Stale`](crate::CacheError::Stale) if the chunk is gone or has no such dirent.
    pub fn map_dirent(&self, chunk: ChunkId, index: usize) -> Result<u64> {
        self.core.map_dirent(chunk, index)
    }

    /// Resolve a cookie from [`map_dirent`](Self::map_dirent).
    ///
    /// # Errors
    ///
    /// [`Expired`](crate::CacheError::Expired) if the issuing chunk was evicted or the cookie
    /// aged out of the cookie map. The caller must restart the listing from the beginning.
    pub fn unmap_dirent(&self, cookie: u64) -> Result<MappedDirent<B::Id>> {
        self.core.unmap_dirent(cookie)
    }

    /// Number of live cookies.
    #[must_use]
    pub fn cookies_live(&self) -> usize {
        self.core.dirmap.len()
    }

    /// Snapshot of the cache-wide counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.core.counters.snapshot()
    }

    /// Queue lengths of every lane.
    #[must_use]
    pub fn lane_lengths(&self) -> Vec<LaneLengths> {
        self.core.lane_lengths()
    }

    /// Stop the reclaimer and destroy every entry and chunk, ignoring references and pins.
    ///
    /// Only call this once the protocol layer guarantees no further requests. Afterwards every
    /// operation reports [`ShutDown`](crate::CacheError::ShutDown) and releases are ignored.
    pub async fn shutdown(&self) {
        if !self.core.begin_shutdown() {
            return;
        }
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            self.core.stop_reclaimer().await;
            if let Err(err) = worker.await {
                debug!(error = %err, "reclaimer ended abnormally");
            }
        }
        let destroyed = self.core.drain();
        info!(destroyed, "handle cache shut down");
    }
}

impl<B: Backend> Drop for HandleCache<B> {
    fn drop(&mut self) {
        self.core.signal_stop();
    }
}
