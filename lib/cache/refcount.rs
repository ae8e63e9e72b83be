//! Reference kinds, entry states, and the guarded per-entry counter.

/// The reference count held by the identity index itself.
pub const SENTINEL_REFCOUNT: u32 = 1;

/// The kind of reference a caller takes with [`acquire`](crate::HandleCache::acquire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefFlag {
    /// A request-path reference. Warm entries move to the warm head; cold entries keep their
    /// place until they prove reuse.
    Touch,
    /// A reference that also counts as a second touch: cold entries are promoted to warm.
    Promote,
    /// A short internal loan that must not disturb the entry's queue position.
    TemporaryBorrow,
}

/// Observable lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Only the index holds the entry; it is a reclamation candidate.
    Unreferenced,
    /// At least one caller holds a reference.
    Active,
    /// The entry backs open or lock state and is exempt from reclamation. An entry can be both
    /// pinned and referenced; pinning takes precedence in this report.
    Pinned,
    /// Killed: no longer reachable from the index, destroyed on the last release.
    Zombie,
}

/// Checked reference counter.
///
/// Transitions never wrap: releasing at zero is reported to the caller instead of underflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefCount(u32);

impl RefCount {
    /// Index sentinel only.
    pub(crate) fn sentinel() -> Self {
        Self(SENTINEL_REFCOUNT)
    }

    /// Index sentinel plus one caller reference.
    pub(crate) fn sentinel_and_caller() -> Self {
        Self(SENTINEL_REFCOUNT + 1)
    }

    pub(crate) fn get(self) -> u32 {
        self.0
    }

    /// Whether any caller (not just the index) holds the entry.
    pub(crate) fn is_active(self) -> bool {
        self.0 > SENTINEL_REFCOUNT
    }

    pub(crate) fn acquire(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    /// Drop one reference, returning the new count, or `None` if the count was already zero.
    pub(crate) fn release(&mut self) -> Option<u32> {
        self.0 = self.0.checked_sub(1)?;
        Some(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_acquire_release_returns_to_sentinel() {
        let mut refs = RefCount::sentinel();
        for _ in 0..5 {
            refs.acquire();
        }
        assert!(refs.is_active());
        for _ in 0..5 {
            refs.release();
        }
        assert_eq!(refs.get(), SENTINEL_REFCOUNT);
        assert!(!refs.is_active());
    }

    #[test]
    fn release_at_zero_is_refused() {
        let mut refs = RefCount::sentinel();
        assert_eq!(refs.release(), Some(0));
        assert_eq!(refs.release(), None);
        assert_eq!(refs.get(), 0);
    }
}
