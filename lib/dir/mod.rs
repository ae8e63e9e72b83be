//! The directory chunk cache and its cookie map.

pub mod chunk;
pub(crate) mod dirmap;

pub use chunk::{ChunkId, ChunkRef, DirEntry, MappedDirent};
pub use dirmap::FIRST_COOKIE;
