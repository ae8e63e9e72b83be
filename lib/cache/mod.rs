//! The lane-sharded entry cache.

pub(crate) mod core;
pub(crate) mod counters;
pub mod lane;
pub mod list;
pub(crate) mod populate;
pub(crate) mod reclaim;
pub mod refcount;
pub mod store;

pub use counters::CacheStats;
pub use lane::{EntryId, EntryInfo, LANES, LaneLengths, QueueKind, lane_of};
pub use reclaim::PassReport;
pub use refcount::{EntryState, RefFlag, SENTINEL_REFCOUNT};
