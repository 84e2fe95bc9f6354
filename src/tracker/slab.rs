//! Generational slot arena with an intrusive doubly-linked list.
//!
//! Records live in a `Vec` of slots addressed by stable index. Occupied slots
//! are threaded into a list (newest at the head) that drives the aging sweep;
//! vacant slots form a free list. Every slot carries a generation that is
//! bumped on removal so a stale [`SlotId`] never aliases a reused slot.

use std::collections::TryReserveError;

use super::BlockRecord;

/// Stable handle to an occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
enum Entry {
    Occupied {
        record: BlockRecord,
        prev: Option<u32>,
        next: Option<u32>,
    },
    Vacant {
        next_free: Option<u32>,
    },
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Entry,
}

#[derive(Debug, Default)]
pub struct Slab {
    slots: Vec<Slot>,
    head: Option<u32>,
    free: Option<u32>,
    len: usize,
}

impl Slab {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            head: None,
            free: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Reserve room for one more record without aborting on allocation failure.
    pub fn try_reserve_one(&mut self) -> Result<(), TryReserveError> {
        if self.free.is_some() {
            return Ok(());
        }
        self.slots.try_reserve(1)
    }

    /// Insert a record at the head of the list.
    ///
    /// Callers must have called [`Slab::try_reserve_one`] first; pushing onto a
    /// fresh slot then never reallocates.
    pub fn insert_front(&mut self, record: BlockRecord) -> SlotId {
        let old_head = self.head;
        let occupied = Entry::Occupied {
            record,
            prev: None,
            next: old_head,
        };

        let index = match self.free {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                if let Entry::Vacant { next_free } = slot.entry {
                    self.free = next_free;
                }
                slot.entry = occupied;
                index
            }
            None => {
                let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
                self.slots.push(Slot {
                    generation: 0,
                    entry: occupied,
                });
                index
            }
        };

        if let Some(old) = old_head {
            self.set_prev(old, Some(index));
        }
        self.head = Some(index);
        self.len += 1;

        SlotId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&BlockRecord> {
        match self.slots.get(id.index as usize) {
            Some(Slot {
                generation,
                entry: Entry::Occupied { record, .. },
            }) if *generation == id.generation => Some(record),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut BlockRecord> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot {
                generation,
                entry: Entry::Occupied { record, .. },
            }) if *generation == id.generation => Some(record),
            _ => None,
        }
    }

    /// Unlink and free a slot, returning its record.
    pub fn remove(&mut self, id: SlotId) -> Option<BlockRecord> {
        let free = self.free;
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        let (record, prev, next) = match std::mem::replace(
            &mut slot.entry,
            Entry::Vacant { next_free: free },
        ) {
            Entry::Occupied { record, prev, next } => (record, prev, next),
            vacant @ Entry::Vacant { .. } => {
                slot.entry = vacant;
                return None;
            }
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free = Some(id.index);

        match prev {
            Some(p) => self.set_next(p, next),
            None => self.head = next,
        }
        if let Some(n) = next {
            self.set_prev(n, prev);
        }
        self.len -= 1;

        Some(record)
    }

    /// First (most recently inserted) slot.
    pub fn head(&self) -> Option<SlotId> {
        self.head.map(|index| self.id_at(index))
    }

    /// Slot after `id` in list order, or `None` at the tail or for a stale id.
    pub fn next(&self, id: SlotId) -> Option<SlotId> {
        match self.slots.get(id.index as usize) {
            Some(Slot {
                generation,
                entry: Entry::Occupied { next, .. },
            }) if *generation == id.generation => next.map(|index| self.id_at(index)),
            _ => None,
        }
    }

    /// Iterate occupied records in list order.
    pub fn iter(&self) -> impl Iterator<Item = &BlockRecord> + '_ {
        let mut cursor = self.head();
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.next(id);
            self.get(id)
        })
    }

    fn id_at(&self, index: u32) -> SlotId {
        SlotId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn set_prev(&mut self, index: u32, value: Option<u32>) {
        if let Entry::Occupied { prev, .. } = &mut self.slots[index as usize].entry {
            *prev = value;
        }
    }

    fn set_next(&mut self, index: u32, value: Option<u32>) {
        if let Entry::Occupied { next, .. } = &mut self.slots[index as usize].entry {
            *next = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: u64) -> BlockRecord {
        BlockRecord {
            address,
            weight: 1,
            ttl: 64,
        }
    }

    fn insert(slab: &mut Slab, address: u64) -> SlotId {
        slab.try_reserve_one().expect("reserve");
        slab.insert_front(record(address))
    }

    fn addresses(slab: &Slab) -> Vec<u64> {
        slab.iter().map(|r| r.address).collect()
    }

    #[test]
    fn test_insert_front_orders_newest_first() {
        let mut slab = Slab::with_capacity(4);
        insert(&mut slab, 1);
        insert(&mut slab, 2);
        insert(&mut slab, 3);

        assert_eq!(slab.len(), 3);
        assert_eq!(addresses(&slab), vec![3, 2, 1]);
    }

    #[test]
    fn test_remove_middle_head_and_tail() {
        let mut slab = Slab::with_capacity(4);
        let a = insert(&mut slab, 1);
        let b = insert(&mut slab, 2);
        let c = insert(&mut slab, 3);

        assert_eq!(slab.remove(b).map(|r| r.address), Some(2));
        assert_eq!(addresses(&slab), vec![3, 1]);

        assert_eq!(slab.remove(c).map(|r| r.address), Some(3));
        assert_eq!(addresses(&slab), vec![1]);

        assert_eq!(slab.remove(a).map(|r| r.address), Some(1));
        assert!(addresses(&slab).is_empty());
        assert_eq!(slab.len(), 0);
        assert!(slab.head().is_none());
    }

    #[test]
    fn test_stale_id_rejected_after_reuse() {
        let mut slab = Slab::with_capacity(2);
        let old = insert(&mut slab, 10);
        slab.remove(old);

        let new = insert(&mut slab, 20);
        assert_ne!(old, new, "generation must change on reuse");
        assert!(slab.get(old).is_none());
        assert!(slab.remove(old).is_none());
        assert!(slab.next(old).is_none());
        assert_eq!(slab.get(new).map(|r| r.address), Some(20));
    }

    #[test]
    fn test_free_slots_reused_before_growing() {
        let mut slab = Slab::with_capacity(0);
        let ids: Vec<SlotId> = (0..8).map(|a| insert(&mut slab, a)).collect();
        let grown = slab.slots.len();

        for id in &ids[..4] {
            slab.remove(*id);
        }
        for a in 100..104 {
            insert(&mut slab, a);
        }

        assert_eq!(slab.slots.len(), grown);
        assert_eq!(slab.len(), 8);
    }

    #[test]
    fn test_walk_survives_removal_of_visited_slot() {
        let mut slab = Slab::with_capacity(4);
        for a in 0..4 {
            insert(&mut slab, a);
        }

        let mut cursor = slab.head();
        let mut seen = Vec::new();
        while let Some(id) = cursor {
            let next = slab.next(id);
            let rec = slab.remove(id).expect("live slot");
            seen.push(rec.address);
            cursor = next;
        }

        assert_eq!(seen, vec![3, 2, 1, 0]);
        assert_eq!(slab.len(), 0);
    }
}
