//! A deterministic in-memory backend.
//!
//! `SimBackend` serves a tree of directories and files held entirely in memory. It counts every
//! call the engine makes into it, and lets callers inject errors, panics, and latency per object,
//! which makes it the backend of choice for the soak workload and the test suite.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::time::Duration;

use tracing::trace;

use crate::backend::{Backend, DirWindow, ObjectAttrs, ObjectKind, RawDirent};
use crate::sync::Arc;
use crate::sync::atomic::{AtomicU64, Ordering};

/// Identity of the root directory.
pub const ROOT: u64 = 1;

/// Attributes served by [`SimBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimAttrs {
    /// Object identity.
    pub id: u64,
    /// Object kind.
    pub kind: ObjectKind,
    /// Size in bytes; the number of children for directories.
    pub size: u64,
}

impl ObjectAttrs for SimAttrs {
    fn kind(&self) -> ObjectKind {
        self.kind
    }
}

#[derive(Debug, Clone)]
struct SimNode {
    kind: ObjectKind,
    size: u64,
    /// Children keyed by identity, which doubles as the readdir cookie.
    children: BTreeMap<u64, OsString>,
}

impl SimNode {
    fn attrs(&self, id: u64) -> SimAttrs {
        let size = if self.kind == ObjectKind::Directory {
            self.children.len() as u64
        } else {
            self.size
        };
        SimAttrs {
            id,
            kind: self.kind,
            size,
        }
    }
}

/// A fault injected into every call that touches one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with the given errno.
    Errno(i32),
    /// Panic inside the backend.
    Panic,
}

#[derive(Debug)]
struct SimInner {
    nodes: scc::HashMap<u64, SimNode>,
    faults: scc::HashMap<u64, Fault>,
    next_id: AtomicU64,
    latency_us: AtomicU64,
    getattr_calls: AtomicU64,
    readdir_calls: AtomicU64,
    forgets: AtomicU64,
}

/// In-memory backend. Cheap to clone; clones share the same tree.
#[derive(Debug, Clone)]
pub struct SimBackend {
    inner: Arc<SimInner>,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    /// A backend holding only an empty root directory.
    #[must_use]
    pub fn new() -> Self {
        let nodes = scc::HashMap::new();
        drop(nodes.insert_sync(
            ROOT,
            SimNode {
                kind: ObjectKind::Directory,
                size: 0,
                children: BTreeMap::new(),
            },
        ));
        Self {
            inner: Arc::new(SimInner {
                nodes,
                faults: scc::HashMap::new(),
                next_id: AtomicU64::new(ROOT + 1),
                latency_us: AtomicU64::new(0),
                getattr_calls: AtomicU64::new(0),
                readdir_calls: AtomicU64::new(0),
                forgets: AtomicU64::new(0),
            }),
        }
    }

    /// A backend with `dirs` directories under the root, each holding `files_per_dir` files.
    #[must_use]
    pub fn with_tree(dirs: usize, files_per_dir: usize) -> Self {
        let sim = Self::new();
        for d in 0..dirs {
            let Ok(dir) = sim.add_dir(ROOT, format!("dir{d:04}")) else {
                continue;
            };
            for f in 0..files_per_dir {
                drop(sim.add_file(dir, format!("file{f:05}"), (f as u64) * 512));
            }
        }
        sim
    }

    fn add_node(&self, parent: u64, name: OsString, kind: ObjectKind, size: u64) -> io::Result<u64> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let linked = self.inner.nodes.update_sync(&parent, |_, node| {
            if node.kind == ObjectKind::Directory {
                node.children.insert(id, name);
                true
            } else {
                false
            }
        });
        match linked {
            Some(true) => {}
            Some(false) => return Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
            None => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
        drop(self.inner.nodes.insert_sync(
            id,
            SimNode {
                kind,
                size,
                children: BTreeMap::new(),
            },
        ));
        Ok(id)
    }

    /// Create a file under `parent`.
    ///
    /// # Errors
    ///
    /// `ENOENT` if `parent` does not exist, `ENOTDIR` if it is not a directory.
    pub fn add_file(&self, parent: u64, name: impl Into<OsString>, size: u64) -> io::Result<u64> {
        self.add_node(parent, name.into(), ObjectKind::File, size)
    }

    /// Create a directory under `parent`.
    ///
    /// # Errors
    ///
    /// `ENOENT` if `parent` does not exist, `ENOTDIR` if it is not a directory.
    pub fn add_dir(&self, parent: u64, name: impl Into<OsString>) -> io::Result<u64> {
        self.add_node(parent, name.into(), ObjectKind::Directory, 0)
    }

    /// Unlink `id` from `parent` and delete it.
    pub fn remove(&self, parent: u64, id: u64) {
        self.inner.nodes.update_sync(&parent, |_, node| {
            node.children.remove(&id);
        });
        self.inner.nodes.remove_sync(&id);
    }

    /// Change the size of a file.
    pub fn set_size(&self, id: u64, size: u64) {
        self.inner.nodes.update_sync(&id, |_, node| node.size = size);
    }

    /// Inject `fault` into every subsequent call touching `id`.
    pub fn inject(&self, id: u64, fault: Fault) {
        self.inner.faults.upsert_sync(id, fault);
    }

    /// Remove any fault injected for `id`.
    pub fn clear_fault(&self, id: u64) {
        self.inner.faults.remove_sync(&id);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.inner.latency_us.store(us, Ordering::Relaxed);
    }

    /// Number of `getattr` calls served.
    #[must_use]
    pub fn getattr_calls(&self) -> u64 {
        self.inner.getattr_calls.load(Ordering::Relaxed)
    }

    /// Number of `readdir` calls served.
    #[must_use]
    pub fn readdir_calls(&self) -> u64 {
        self.inner.readdir_calls.load(Ordering::Relaxed)
    }

    /// Number of identities the engine reported as destroyed.
    #[must_use]
    pub fn forgets(&self) -> u64 {
        self.inner.forgets.load(Ordering::Relaxed)
    }
}

impl SimInner {
    async fn enter(&self, id: u64) -> io::Result<()> {
        let us = self.latency_us.load(Ordering::Relaxed);
        if us > 0 {
            tokio::time::sleep(Duration::from_micros(us)).await;
        }
        match self.faults.read_sync(&id, |_, fault| *fault) {
            Some(Fault::Errno(errno)) => Err(io::Error::from_raw_os_error(errno)),
            Some(Fault::Panic) => panic!("injected backend panic for object {id}"),
            None => Ok(()),
        }
    }

    fn attrs(&self, id: u64) -> io::Result<SimAttrs> {
        self.nodes
            .read_sync(&id, |_, node| node.attrs(id))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }
}

impl Backend for SimBackend {
    type Id = u64;
    type Attrs = SimAttrs;

    fn getattr(&self, id: &u64) -> impl Future<Output = io::Result<SimAttrs>> + Send {
        let inner = Arc::clone(&self.inner);
        let id = *id;
        async move {
            inner.getattr_calls.fetch_add(1, Ordering::Relaxed);
            inner.enter(id).await?;
            trace!(id, "sim getattr");
            inner.attrs(id)
        }
    }

    fn readdir(
        &self,
        dir: &u64,
        whence: u64,
        max: usize,
    ) -> impl Future<Output = io::Result<DirWindow<u64, SimAttrs>>> + Send {
        let inner = Arc::clone(&self.inner);
        let dir = *dir;
        async move {
            inner.readdir_calls.fetch_add(1, Ordering::Relaxed);
            inner.enter(dir).await?;
            let listing = inner
                .nodes
                .read_sync(&dir, |_, node| {
                    (node.kind == ObjectKind::Directory).then(|| {
                        node.children
                            .range(whence.saturating_add(1)..)
                            .map(|(id, name)| (*id, name.clone()))
                            .take(max.saturating_add(1))
                            .collect::<Vec<_>>()
                    })
                })
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTDIR))?;

            let eod = listing.len() <= max;
            let entries = listing
                .into_iter()
                .take(max)
                .filter_map(|(id, name)| {
                    let attrs = inner.attrs(id).ok()?;
                    Some(RawDirent {
                        name,
                        cookie: id,
                        id,
                        attrs,
                    })
                })
                .collect();
            trace!(dir, whence, eod, "sim readdir");
            Ok(DirWindow { entries, eod })
        }
    }

    fn forget(&self, id: &u64) {
        trace!(id = *id, "sim forget");
        self.inner.forgets.fetch_add(1, Ordering::Relaxed);
    }
}
