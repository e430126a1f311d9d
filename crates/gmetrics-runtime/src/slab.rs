//! The arena that owns every [`BlockStore`]: a fixed-capacity, index-
//! addressed slab rather than a self-referential structure.
//!
//! This stands in for the original's "sentinel store" — a block store
//! whose own payload blocks held the records of every other store,
//! including itself. Rust doesn't need that self-hosting trick to avoid
//! a second allocator: a plain `Vec` with a free list gives the same
//! "stable index, bounded capacity, no relocation" contract without the
//! cyclic ownership. See DESIGN.md for this simplification.

use gmetrics_core::BlockStore;

/// Stable handle to a store inside a [`Slab`]. Never reused while the
/// store it names is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(u32);

pub struct Slab {
    slots: Vec<Option<BlockStore>>,
    free_list: Vec<u32>,
    capacity: usize,
}

impl Slab {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { slots: Vec::new(), free_list: Vec::new(), capacity }
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() - self.free_list.len() >= self.capacity
    }

    pub fn insert(&mut self, store: BlockStore) -> StoreId {
        if let Some(index) = self.free_list.pop() {
            self.slots[index as usize] = Some(store);
            StoreId(index)
        } else {
            self.slots.push(Some(store));
            StoreId((self.slots.len() - 1) as u32)
        }
    }

    pub fn get(&self, id: StoreId) -> Option<&BlockStore> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: StoreId) -> Option<&mut BlockStore> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn remove(&mut self, id: StoreId) -> Option<BlockStore> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let removed = slot.take();
        if removed.is_some() {
            self.free_list.push(id.0);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_slots_are_reused() {
        let mut slab = Slab::with_capacity(8);
        let a = slab.insert(BlockStore::new("a", 64 * 64).unwrap());
        slab.remove(a);
        let b = slab.insert(BlockStore::new("b", 64 * 64).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn is_full_respects_capacity_net_of_removals() {
        let mut slab = Slab::with_capacity(1);
        let a = slab.insert(BlockStore::new("a", 64 * 64).unwrap());
        assert!(slab.is_full());
        slab.remove(a);
        assert!(!slab.is_full());
    }
}
