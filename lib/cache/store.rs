//! Fixed-shape record allocator backing cache entries and directory chunks.
//!
//! Records live in a slab of slots addressed by [`SlotKey`]. Freed slots are recycled through an
//! intrusive free list, and every slot carries a generation that is bumped on free, so a key that
//! outlived its record never resolves to whatever reused the slot.

/// Stable handle to a record in a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    /// Slot index inside the store.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the record this key was issued for.
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// A generational slab.
#[derive(Debug)]
pub struct Store<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Store<T> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the store holds no live records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Place `value` in a free slot, reusing a vacated one when available.
    pub fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let (generation, next_free) = match *slot {
                Slot::Vacant {
                    generation,
                    next_free,
                } => (generation, next_free),
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { generation, value };
            self.free_head = next_free;
            return SlotKey { index, generation };
        }

        #[expect(
            clippy::cast_possible_truncation,
            reason = "a lane never holds anywhere near u32::MAX records"
        )]
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        SlotKey {
            index,
            generation: 0,
        }
    }

    /// Resolve `key`, returning `None` if the record was freed.
    #[must_use]
    pub fn get(&self, key: SlotKey) -> Option<&T> {
        match self.slots.get(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        match self.slots.get_mut(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Whether `key` still names a live record.
    #[must_use]
    pub fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    /// Free the record named by `key` and hand it back.
    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            generation: key.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) else {
            unreachable!("slot checked as occupied above");
        };
        self.free_head = Some(key.index);
        self.len -= 1;
        Some(value)
    }

    /// Iterate over all live records.
    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, value } => {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "indices were issued as u32 by insert"
                )]
                let index = index as u32;
                Some((
                    SlotKey {
                        index,
                        generation: *generation,
                    },
                    value,
                ))
            }
            Slot::Vacant { .. } => None,
        })
    }

    /// Free every live record, returning them in slot order.
    ///
    /// Generations keep advancing, so keys issued before the drain stay dead.
    pub fn drain(&mut self) -> Vec<T> {
        let keys: Vec<SlotKey> = self.iter().map(|(key, _)| key).collect();
        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }
}
