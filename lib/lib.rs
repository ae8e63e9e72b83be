//! fhcache: the object-handle cache at the heart of a network file server.
//!
//! The engine sits between a protocol layer and a backend filesystem driver. It caches object
//! handles with their attributes in lane-sharded two-queue LRUs, keeps entries backing open or
//! lock state pinned, reclaims in the background against configurable watermarks, and caches
//! directory listings as bounded chunks addressable through opaque resume cookies.

pub mod backend;
pub mod cache;
pub mod config;
pub mod dir;
mod engine;
pub mod error;
pub mod sim;
/// Shims between loom and std synchronization primitives.
pub mod sync;

pub use backend::{Backend, DirWindow, ObjectAttrs, ObjectKind, RawDirent};
pub use cache::{
    CacheStats, EntryId, EntryInfo, EntryState, LANES, LaneLengths, PassReport, QueueKind,
    RefFlag, SENTINEL_REFCOUNT, lane_of,
};
pub use config::{ConfigError, LruConfig};
pub use dir::{ChunkId, ChunkRef, DirEntry, FIRST_COOKIE, MappedDirent};
pub use engine::HandleCache;
pub use error::{CacheError, Result};
