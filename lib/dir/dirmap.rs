//! The cookie map: opaque resume cookies handed to clients, resolved back to a dirent slot.

use hashlink::LinkedHashMap;
use tracing::trace;

use super::chunk::ChunkId;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Mutex, lock};

/// Cookies below this are reserved for directory-wide anchors (start, `.`, `..`).
pub const FIRST_COOKIE: u64 = 3;

/// Where a cookie points: one dirent slot of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirentLoc {
    pub(crate) chunk: ChunkId,
    pub(crate) index: usize,
}

/// Insertion-ordered cookie map, capped at a fixed size.
///
/// Resolving a cookie refreshes its position, so cookies clients actively resume from survive
/// the cap while abandoned ones age out.
#[derive(Debug)]
pub(crate) struct DirMap {
    map: Mutex<LinkedHashMap<u64, DirentLoc>>,
    next: AtomicU64,
    hiwat: usize,
}

impl DirMap {
    pub(crate) fn new(hiwat: usize) -> Self {
        Self {
            map: Mutex::new(LinkedHashMap::new()),
            next: AtomicU64::new(FIRST_COOKIE),
            hiwat,
        }
    }

    /// Reserve a fresh cookie number. Cookies are never reused.
    pub(crate) fn next_cookie(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, cookie: u64, loc: DirentLoc) {
        let mut map = lock(&self.map);
        map.insert(cookie, loc);
        while map.len() > self.hiwat {
            if let Some((old, _)) = map.pop_front() {
                trace!(cookie = old, "cookie map full, dropped oldest cookie");
            }
        }
    }

    /// Resolve `cookie`, moving it to the young end of the map.
    pub(crate) fn lookup(&self, cookie: u64) -> Option<DirentLoc> {
        let mut map = lock(&self.map);
        let loc = map.remove(&cookie)?;
        map.insert(cookie, loc);
        Some(loc)
    }

    pub(crate) fn remove(&self, cookie: u64) {
        lock(&self.map).remove(&cookie);
    }

    /// Drop the cookies issued by chunks that have left the cache.
    pub(crate) fn forget(&self, cookies: &[u64]) {
        if cookies.is_empty() {
            return;
        }
        let mut map = lock(&self.map);
        for cookie in cookies {
            map.remove(cookie);
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.map).len()
    }

    pub(crate) fn clear(&self) {
        lock(&self.map).clear();
    }
}
