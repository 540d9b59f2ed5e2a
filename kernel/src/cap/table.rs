//! Per-group capability slot table

use super::{Cap, CapRights};
use crate::error::{KResult, KernelError};
use crate::object::Object;
use std::sync::Arc;

/// A populated slot
#[derive(Clone)]
pub struct Slot {
    pub object: Arc<Object>,
    pub rights: CapRights,
}

/// Slot table that grows in fixed chunks up to a hard limit
///
/// A bitmap tracks occupied slots so allocation always returns the lowest
/// free index.
pub struct SlotTable {
    slots: Vec<Option<Slot>>,
    used: Vec<u64>,
    count: usize,
    chunk: usize,
    max: usize,
}

impl SlotTable {
    pub fn new(chunk: usize, max: usize) -> Self {
        let mut table = Self {
            slots: Vec::new(),
            used: Vec::new(),
            count: 0,
            chunk,
            max,
        };
        table.grow();
        table
    }

    /// Lookup slot by index
    pub fn get(&self, cap: Cap) -> Option<&Slot> {
        self.slots.get(cap.index()).and_then(Option::as_ref)
    }

    /// Insert at the lowest free index, growing the table if needed.
    pub fn insert_next(&mut self, slot: Slot) -> KResult<Cap> {
        let index = match self.first_free() {
            Some(index) => index,
            None => {
                if !self.grow() {
                    return Err(KernelError::NoSlots);
                }
                self.first_free().ok_or(KernelError::NoSlots)?
            }
        };
        self.slots[index] = Some(slot);
        self.used[index / 64] |= 1 << (index % 64);
        self.count += 1;
        Ok(Cap::from_index(index))
    }

    /// Empty a slot, returning what it held
    pub fn remove(&mut self, cap: Cap) -> Option<Slot> {
        let index = cap.index();
        let slot = self.slots.get_mut(index)?.take()?;
        self.used[index / 64] &= !(1 << (index % 64));
        self.count -= 1;
        Some(slot)
    }

    /// Occupied slots in index order
    pub fn iter(&self) -> impl Iterator<Item = (Cap, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (Cap::from_index(i), s)))
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Slots currently allocated, occupied or not.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn first_free(&self) -> Option<usize> {
        self.used.iter().enumerate().find_map(|(word_index, word)| {
            let bit = word.trailing_ones() as usize;
            let index = word_index * 64 + bit;
            (bit < 64 && index < self.slots.len()).then_some(index)
        })
    }

    fn grow(&mut self) -> bool {
        let new_len = (self.slots.len() + self.chunk).min(self.max);
        if new_len == self.slots.len() {
            return false;
        }
        self.slots.resize(new_len, None);
        self.used.resize(new_len.div_ceil(64), 0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::notification::Notification;
    use crate::object::ObjectBody;
    use crate::testutil::boot;

    fn slot(kernel: &crate::Kernel) -> Slot {
        Slot {
            object: kernel.obj_alloc(ObjectBody::Notification(Notification::new())).unwrap(),
            rights: CapRights::ALL,
        }
    }

    #[test]
    fn test_lowest_free_slot_is_reused() {
        let (kernel, _root) = boot(1);
        let mut table = SlotTable::new(4, 16);
        let a = table.insert_next(slot(&kernel)).unwrap();
        let b = table.insert_next(slot(&kernel)).unwrap();
        let c = table.insert_next(slot(&kernel)).unwrap();
        assert_eq!((a.raw(), b.raw(), c.raw()), (0, 1, 2));
        assert!(table.remove(b).is_some());
        assert!(table.remove(b).is_none());
        assert_eq!(table.insert_next(slot(&kernel)).unwrap(), b);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_grows_by_chunk_until_limit() {
        let (kernel, _root) = boot(1);
        let mut table = SlotTable::new(4, 10);
        assert_eq!(table.capacity(), 4);
        for _ in 0..5 {
            table.insert_next(slot(&kernel)).unwrap();
        }
        assert_eq!(table.capacity(), 8);
        for _ in 0..5 {
            table.insert_next(slot(&kernel)).unwrap();
        }
        assert_eq!(table.capacity(), 10);
        assert_eq!(table.insert_next(slot(&kernel)).err(), Some(KernelError::NoSlots));
    }

    #[test]
    fn test_bitmap_crosses_word_boundary() {
        let (kernel, _root) = boot(1);
        let mut table = SlotTable::new(64, 256);
        for _ in 0..70 {
            table.insert_next(slot(&kernel)).unwrap();
        }
        assert!(table.remove(Cap::from_index(65)).is_some());
        assert_eq!(table.insert_next(slot(&kernel)).unwrap().index(), 65);
        assert_eq!(table.iter().count(), 70);
    }
}
