//! Directory chunks: bounded windows of a directory listing.
//!
//! A chunk is produced by one backend enumeration starting at a resume position and lives in the
//! lane of the directory that owns it, on that lane's full-LRU chunk queue. Chunks hold their
//! own reference count; referenced chunks are never evicted, but killing the owning directory
//! frees all of its chunks at once.

use std::ffi::OsString;
use std::sync::Arc;

use tracing::trace;

use super::dirmap::DirentLoc;
use crate::backend::{Backend, ObjectKind};
use crate::cache::core::CacheCore;
use crate::cache::lane::{EntryId, LaneState, Teardown};
use crate::cache::list::{Link, Linked};
use crate::cache::store::SlotKey;
use crate::error::{CacheError, Result, ref_violation};

/// Handle to a directory chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    lane: u8,
    key: SlotKey,
}

impl ChunkId {
    fn new(parent: EntryId, key: SlotKey) -> Self {
        #[expect(clippy::cast_possible_truncation, reason = "lane is below LANES")]
        let lane = parent.lane() as u8;
        Self { lane, key }
    }

    fn lane(self) -> usize {
        usize::from(self.lane)
    }
}

/// One entry of a cached directory listing.
#[derive(Debug, Clone)]
pub struct DirEntry<I> {
    /// Name within the directory.
    pub name: OsString,
    /// The backend's resume position after this entry.
    pub cookie: u64,
    /// Backend identity of the target.
    pub id: I,
    /// The cache entry for the target, if it could be indexed. This is a plain handle: it holds
    /// no reference and goes stale if the target is reclaimed.
    pub entry: Option<EntryId>,
}

/// A resident chunk.
pub(crate) struct Chunk<B: Backend> {
    pub(crate) parent: SlotKey,
    pub(crate) start: u64,
    pub(crate) dirents: Arc<[DirEntry<B::Id>]>,
    pub(crate) eod: bool,
    pub(crate) refs: u32,
    /// The cookie issued for each dirent, if any. A dirent keeps its cookie for as long as the
    /// chunk stays resident.
    pub(crate) cookies: Box<[Option<u64>]>,
    link: Link,
}

impl<B: Backend> Linked for Chunk<B> {
    fn link(&self) -> &Link {
        &self.link
    }

    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// Where `whence` falls in a window that starts at `start`: the index of the first dirent to
/// return, or `None` if the window does not cover it.
fn position<I>(start: u64, dirents: &[DirEntry<I>], eod: bool, whence: u64) -> Option<usize> {
    if whence == start {
        return Some(0);
    }
    let i = dirents.iter().position(|d| d.cookie == whence)?;
    (i + 1 < dirents.len() || eod).then_some(i + 1)
}

impl<B: Backend> Chunk<B> {
    fn covers(&self, whence: u64) -> bool {
        position(self.start, &self.dirents, self.eod, whence).is_some()
    }
}

/// A caller's view of a chunk returned by [`get_chunk`](crate::HandleCache::get_chunk).
///
/// The view carries one chunk reference, which the caller hands back either by passing the id as
/// `prev` to the next `get_chunk` or through [`release_chunk`](crate::HandleCache::release_chunk).
#[derive(Debug, Clone)]
pub struct ChunkRef<I> {
    id: ChunkId,
    parent: EntryId,
    start: u64,
    dirents: Arc<[DirEntry<I>]>,
    eod: bool,
}

impl<I> ChunkRef<I> {
    /// The chunk's handle.
    #[must_use]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// The directory this chunk belongs to.
    #[must_use]
    pub fn parent(&self) -> EntryId {
        self.parent
    }

    /// The resume position the chunk was enumerated from.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Every dirent in the chunk.
    #[must_use]
    pub fn dirents(&self) -> &[DirEntry<I>] {
        &self.dirents
    }

    /// Whether the chunk reaches the end of the directory.
    #[must_use]
    pub fn eod(&self) -> bool {
        self.eod
    }

    /// Whether the chunk can serve a listing resumed at `whence`.
    #[must_use]
    pub fn covers(&self, whence: u64) -> bool {
        position(self.start, &self.dirents, self.eod, whence).is_some()
    }

    /// The dirents that follow `whence`, or an empty slice if the chunk does not cover it.
    #[must_use]
    pub fn entries_after(&self, whence: u64) -> &[DirEntry<I>] {
        position(self.start, &self.dirents, self.eod, whence)
            .map_or(&[], |i| &self.dirents[i..])
    }

    /// The resume position for the chunk after this one, or `None` at end of directory.
    #[must_use]
    pub fn next_whence(&self) -> Option<u64> {
        if self.eod {
            return None;
        }
        Some(self.dirents.last().map_or(self.start, |d| d.cookie))
    }
}

/// A directory entry resolved from a cookie.
#[derive(Debug, Clone)]
pub struct MappedDirent<I> {
    /// The chunk holding the dirent.
    pub chunk: ChunkId,
    /// Position of the dirent within the chunk.
    pub index: usize,
    /// The directory the dirent belongs to.
    pub parent: EntryId,
    /// The dirent itself.
    pub dirent: DirEntry<I>,
}

impl<B: Backend> LaneState<B> {
    fn chunk_ref(&self, parent: EntryId, key: SlotKey) -> Option<ChunkRef<B::Id>> {
        let chunk = self.chunks.get(key)?;
        Some(ChunkRef {
            id: ChunkId::new(parent, key),
            parent,
            start: chunk.start,
            dirents: Arc::clone(&chunk.dirents),
            eod: chunk.eod,
        })
    }

    /// Find a resident chunk of `dir` that covers `whence`, trying an exact start match first.
    fn find_chunk(&self, dir: SlotKey, whence: u64) -> Option<SlotKey> {
        let entry = self.live(dir)?;
        if let Some(&key) = entry.chunks.get(&whence) {
            return Some(key);
        }
        entry
            .chunks
            .values()
            .copied()
            .find(|&key| self.chunks.get(key).is_some_and(|c| c.covers(whence)))
    }

    /// Take a reference on `key` and move it to the young end of the chunk queue.
    fn grab_chunk(&mut self, key: SlotKey) {
        if let Some(chunk) = self.chunks.get_mut(key) {
            chunk.refs += 1;
        }
        self.touch_chunk(key);
    }

    /// Move `key` to the young end of the chunk queue without taking a reference.
    fn touch_chunk(&mut self, key: SlotKey) {
        if self.chunks.contains(key) {
            self.chunk_lru.move_to_head(&mut self.chunks, key);
        }
    }

    /// Make `chunk` resident and attach it to its directory.
    fn insert_chunk(&mut self, chunk: Chunk<B>) -> SlotKey {
        let (dir, start) = (chunk.parent, chunk.start);
        let key = self.chunks.insert(chunk);
        self.chunk_lru.push_head(&mut self.chunks, key);
        if let Some(entry) = self.entries.get_mut(dir) {
            entry.chunks.insert(start, key);
        }
        key
    }

    fn check_directory(&self, dir: SlotKey) -> Result<()> {
        let entry = self.live(dir).ok_or(CacheError::Stale)?;
        match entry.kind() {
            Some(ObjectKind::Directory) => Ok(()),
            Some(_) => Err(CacheError::NotADirectory),
            None => Err(CacheError::Stale),
        }
    }
}

impl<B: Backend> CacheCore<B> {
    pub(crate) async fn get_chunk(
        &self,
        parent: EntryId,
        prev: Option<ChunkId>,
        whence: u64,
    ) -> Result<ChunkRef<B::Id>> {
        self.check_open()?;
        let dir = parent.key();

        let dir_id = {
            let mut st = self.lane(parent.lane());
            st.check_directory(dir)?;

            if let Some(prev) = prev
                && prev.lane() == parent.lane()
                && st.chunks.get(prev.key).is_some_and(|c| c.parent == dir && c.covers(whence))
            {
                trace!(parent = ?parent, whence, "previous chunk covers resume position");
                return st.chunk_ref(parent, prev.key).ok_or(CacheError::Stale);
            }

            if let Some(key) = st.find_chunk(dir, whence) {
                st.grab_chunk(key);
                let found = st.chunk_ref(parent, key).ok_or(CacheError::Stale);
                drop(st);
                self.release_prev(prev);
                return found;
            }

            st.live(dir).map(|e| e.id.clone()).ok_or(CacheError::Stale)?
        };

        let max = self.config.dir_chunk_size as usize;
        let window = self.backend.readdir(&dir_id, whence, max).await?;
        let dirents: Arc<[DirEntry<B::Id>]> = window
            .entries
            .into_iter()
            .map(|raw| {
                let entry = self.ensure_indexed(raw.id.clone(), raw.attrs);
                DirEntry {
                    name: raw.name,
                    cookie: raw.cookie,
                    id: raw.id,
                    entry,
                }
            })
            .collect();

        let mut teardown = Teardown::default();
        let result = {
            let mut st = self.lane(parent.lane());
            st.check_directory(dir)?;
            if let Some(key) = st.find_chunk(dir, whence) {
                // Someone else enumerated the same window while we were in the backend.
                st.grab_chunk(key);
                st.chunk_ref(parent, key).ok_or(CacheError::Stale)
            } else {
                if self.counters.chunks_used() >= self.config.chunks_hiwat {
                    let evicted = st.reap_chunks(1, &mut teardown);
                    self.counters
                        .note_reclaimed(0, u64::try_from(evicted).unwrap_or(u64::MAX));
                }
                let chunk = Chunk {
                    parent: dir,
                    start: whence,
                    cookies: vec![None; dirents.len()].into_boxed_slice(),
                    dirents,
                    eod: window.eod,
                    refs: 1,
                    link: Link::default(),
                };
                let key = st.insert_chunk(chunk);
                self.counters.chunk_added();
                trace!(parent = ?parent, whence, slot = key.index(), "created chunk");
                st.chunk_ref(parent, key).ok_or(CacheError::Stale)
            }
        };
        self.finish(teardown);
        if result.is_ok() {
            self.release_prev(prev);
        }
        result
    }

    fn release_prev(&self, prev: Option<ChunkId>) {
        if let Some(prev) = prev {
            self.release_chunk(prev);
        }
    }

    pub(crate) fn bump_chunk(&self, id: ChunkId) {
        if self.is_shut_down() {
            return;
        }
        self.lane(id.lane()).touch_chunk(id.key);
    }

    /// Drop one chunk reference. Chunks freed in the meantime (their directory was killed) are
    /// ignored.
    pub(crate) fn release_chunk(&self, id: ChunkId) {
        if self.is_shut_down() {
            return;
        }
        let underflow = {
            let mut st = self.lane(id.lane());
            match st.chunks.get_mut(id.key) {
                Some(chunk) if chunk.refs == 0 => true,
                Some(chunk) => {
                    chunk.refs -= 1;
                    false
                }
                None => false,
            }
        };
        if underflow {
            ref_violation("chunk release without a matching reference", &id);
        }
    }

    pub(crate) fn map_dirent(&self, id: ChunkId, index: usize) -> Result<u64> {
        self.check_open()?;
        let cookie = {
            let mut st = self.lane(id.lane());
            let chunk = st.chunks.get_mut(id.key).ok_or(CacheError::Stale)?;
            let slot = chunk.cookies.get_mut(index).ok_or(CacheError::Stale)?;
            *slot.get_or_insert_with(|| self.dirmap.next_cookie())
        };
        // Re-inserting refreshes a cookie that aged out of the map while its chunk stayed.
        self.dirmap.insert(cookie, DirentLoc { chunk: id, index });
        trace!(chunk = ?id, index, cookie, "mapped dirent");
        Ok(cookie)
    }

    pub(crate) fn unmap_dirent(&self, cookie: u64) -> Result<MappedDirent<B::Id>> {
        self.check_open()?;
        let loc = self
            .dirmap
            .lookup(cookie)
            .ok_or(CacheError::Expired(cookie))?;
        let resolved = {
            let st = self.lane(loc.chunk.lane());
            st.chunks.get(loc.chunk.key).and_then(|chunk| {
                let dirent = chunk.dirents.get(loc.index)?.clone();
                let parent = EntryId::new(loc.chunk.lane(), chunk.parent);
                Some(MappedDirent {
                    chunk: loc.chunk,
                    index: loc.index,
                    parent,
                    dirent,
                })
            })
        };
        resolved.ok_or_else(|| {
            self.dirmap.remove(cookie);
            CacheError::Expired(cookie)
        })
    }
}
