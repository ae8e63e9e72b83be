//! The contract the engine consumes from backend filesystem drivers.
//!
//! The engine never interprets a backend identity beyond hashing and comparing it. Attributes
//! are opaque snapshots except for the object kind, which decides whether directory chunks can
//! be attached to an entry.

use std::ffi::OsString;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

/// The kind of a backend object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ObjectKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// Anything else (devices, sockets, fifos).
    Other,
}

/// An attribute snapshot produced by a backend.
pub trait ObjectAttrs: Clone + Send + Sync + 'static {
    /// The kind of object these attributes describe.
    fn kind(&self) -> ObjectKind;
}

/// One directory entry as returned by [`Backend::readdir`].
#[derive(Debug, Clone)]
pub struct RawDirent<I, A> {
    /// The entry name within its parent.
    pub name: OsString,
    /// The backend's resume position *after* this entry.
    pub cookie: u64,
    /// Identity of the object the entry names.
    pub id: I,
    /// Attributes of that object, fetched alongside the listing.
    pub attrs: A,
}

/// One bounded window of a directory listing.
#[derive(Debug, Clone)]
pub struct DirWindow<I, A> {
    /// The entries in backend order.
    pub entries: Vec<RawDirent<I, A>>,
    /// Whether the window reaches the end of the directory.
    pub eod: bool,
}

/// A backend filesystem driver.
///
/// Methods are only ever invoked with no lane lock held, so implementations are free to block
/// on I/O.
pub trait Backend: Clone + Send + Sync + 'static {
    /// Opaque object identity.
    type Id: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Attribute snapshot type.
    type Attrs: ObjectAttrs;

    /// Fetch the attributes of the object named by `id`.
    fn getattr(
        &self,
        id: &Self::Id,
    ) -> impl Future<Output = Result<Self::Attrs, std::io::Error>> + Send;

    /// Enumerate at most `max` entries of directory `dir`.
    ///
    /// `whence == 0` starts at the beginning of the directory. Any other value is a cookie
    /// previously returned in a [`RawDirent`], and the window starts right after that entry.
    fn readdir(
        &self,
        dir: &Self::Id,
        whence: u64,
        max: usize,
    ) -> impl Future<Output = Result<DirWindow<Self::Id, Self::Attrs>, std::io::Error>> + Send;

    /// Clean up backend-internal state for an identity the cache has destroyed.
    ///
    /// Called after the entry has left its lane, never with a lane lock held.
    fn forget(&self, _id: &Self::Id) {}
}
