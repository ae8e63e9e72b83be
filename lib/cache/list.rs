//! Index-linked queues threaded through a [`Store`].
//!
//! Records carry their own [`Link`], so moving a record between queues, to the head, or to the
//! tail is O(1) and never allocates. The head is the most recently inserted or touched end; the
//! tail is where reclamation looks first.

use super::store::{SlotKey, Store};

/// Neighbour pointers embedded in a queued record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Neighbour towards the head.
    prev: Option<SlotKey>,
    /// Neighbour towards the tail.
    next: Option<SlotKey>,
}

/// Records that can sit on a [`SubList`].
pub trait Linked {
    /// The record's embedded link.
    fn link(&self) -> &Link;
    /// Mutable access to the record's embedded link.
    fn link_mut(&mut self) -> &mut Link;
}

/// A doubly-linked queue of records living in a [`Store`].
///
/// The list does not own its records; it only threads keys. Every operation takes the store the
/// keys belong to. A key must be on at most one list at a time.
#[derive(Debug, Default)]
pub struct SubList {
    head: Option<SlotKey>,
    tail: Option<SlotKey>,
    len: usize,
}

impl SubList {
    /// Number of records on the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The record at the reclamation end.
    #[must_use]
    pub fn tail(&self) -> Option<SlotKey> {
        self.tail
    }

    /// The record at the most-recent end.
    #[must_use]
    pub fn head(&self) -> Option<SlotKey> {
        self.head
    }

    /// The neighbour of `key` one step towards the head.
    pub fn towards_head<T: Linked>(store: &Store<T>, key: SlotKey) -> Option<SlotKey> {
        store.get(key).and_then(|rec| rec.link().prev)
    }

    /// Link `key` in at the head.
    pub fn push_head<T: Linked>(&mut self, store: &mut Store<T>, key: SlotKey) {
        let old_head = self.head;
        let Some(rec) = store.get_mut(key) else {
            return;
        };
        *rec.link_mut() = Link {
            prev: None,
            next: old_head,
        };
        match old_head.and_then(|h| store.get_mut(h)) {
            Some(head) => head.link_mut().prev = Some(key),
            None => self.tail = Some(key),
        }
        self.head = Some(key);
        self.len += 1;
    }

    /// Link `key` in at the tail.
    pub fn push_tail<T: Linked>(&mut self, store: &mut Store<T>, key: SlotKey) {
        let old_tail = self.tail;
        let Some(rec) = store.get_mut(key) else {
            return;
        };
        *rec.link_mut() = Link {
            prev: old_tail,
            next: None,
        };
        match old_tail.and_then(|t| store.get_mut(t)) {
            Some(tail) => tail.link_mut().next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.len += 1;
    }

    /// Unlink `key` from this list. The key must currently be on this list.
    pub fn unlink<T: Linked>(&mut self, store: &mut Store<T>, key: SlotKey) {
        let Some(rec) = store.get_mut(key) else {
            return;
        };
        let Link { prev, next } = std::mem::take(rec.link_mut());

        match prev.and_then(|p| store.get_mut(p)) {
            Some(p) => p.link_mut().next = next,
            None => self.head = next,
        }
        match next.and_then(|n| store.get_mut(n)) {
            Some(n) => n.link_mut().prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Move `key`, already on this list, to the head.
    pub fn move_to_head<T: Linked>(&mut self, store: &mut Store<T>, key: SlotKey) {
        if self.head == Some(key) {
            return;
        }
        self.unlink(store, key);
        self.push_head(store, key);
    }

    /// Move `key`, already on this list, to the tail.
    pub fn move_to_tail<T: Linked>(&mut self, store: &mut Store<T>, key: SlotKey) {
        if self.tail == Some(key) {
            return;
        }
        self.unlink(store, key);
        self.push_tail(store, key);
    }

    /// Forget every record without touching their links. Only valid when the store is being
    /// drained at the same time.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
