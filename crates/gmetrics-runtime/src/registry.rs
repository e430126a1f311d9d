//! The live-store registry: lightweight, copyable records (name, address
//! range, dedicated flag) kept separately from the stores themselves so
//! that address-range lookups (`free`, `realloc`) don't need to touch the
//! `allocations` lock at all.

use crate::slab::StoreId;

pub struct StoreRecord {
    pub id: StoreId,
    pub name: String,
    pub base_addr: usize,
    pub size: usize,
    pub is_dedicated: bool,
}

pub struct Registry {
    pub records: Vec<StoreRecord>,
    pub capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self { records: Vec::new(), capacity }
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn find_owning(&self, addr: usize) -> Option<usize> {
        self.records.iter().position(|record| addr >= record.base_addr && addr < record.base_addr + record.size)
    }
}
