//! String-keyed table of fixed-size records.
//!
//! Mirrors the original's `GMetricsTable`: entries are copied in on
//! `set` and copied out on `get`, iteration order is insertion order
//! until a caller asks for a sorted pass (used once, at flush time, to
//! emit metric rows in a stable order), and records are plain byte
//! buffers the caller interprets.

use std::collections::HashMap;

pub struct Table {
    record_size: usize,
    entries: HashMap<String, Vec<u8>>,
    insertion_order: Vec<String>,
}

impl Table {
    pub fn new(record_size: usize) -> Self {
        Self { record_size, entries: HashMap::new(), insertion_order: Vec::new() }
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Copies `record` into the table under `name`, overwriting any
    /// existing entry. `record.len()` must equal `record_size`.
    pub fn set(&mut self, name: &str, record: &[u8]) {
        debug_assert_eq!(record.len(), self.record_size);
        if !self.entries.contains_key(name) {
            self.insertion_order.push(name.to_string());
        }
        self.entries.insert(name.to_string(), record.to_vec());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        if self.entries.remove(name).is_some() {
            self.insertion_order.retain(|existing| existing != name);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.insertion_order.iter().map(move |name| (name.as_str(), self.entries[name].as_slice()))
    }

    /// Snapshots and sorts entries with a caller-supplied comparator.
    /// Used once per flush so metric rows come out in a predictable order
    /// regardless of hash iteration, with the caller choosing what
    /// "predictable" means for its records (by name, by a field inside
    /// the record, ...).
    pub fn sorted_by<F>(&self, mut compare: F) -> Vec<(&str, &[u8])>
    where
        F: FnMut(&(&str, &[u8]), &(&str, &[u8])) -> std::cmp::Ordering,
    {
        let mut items: Vec<_> = self.iter().collect();
        items.sort_by(|a, b| compare(a, b));
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips_the_record() {
        let mut table = Table::new(4);
        table.set("alpha", &[1, 2, 3, 4]);
        assert_eq!(table.get("alpha"), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn overwriting_a_key_does_not_duplicate_insertion_order() {
        let mut table = Table::new(1);
        table.set("a", &[1]);
        table.set("b", &[2]);
        table.set("a", &[9]);
        assert_eq!(table.iter().map(|(name, _)| name).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn sorted_by_name_comparator_ignores_insertion_order() {
        let mut table = Table::new(1);
        table.set("zebra", &[1]);
        table.set("apple", &[2]);
        let sorted = table.sorted_by(|a, b| a.0.cmp(b.0));
        assert_eq!(sorted.iter().map(|(name, _)| *name).collect::<Vec<_>>(), vec!["apple", "zebra"]);
    }

    #[test]
    fn sorted_by_record_bytes_uses_the_given_comparator() {
        let mut table = Table::new(1);
        table.set("a", &[3]);
        table.set("b", &[1]);
        table.set("c", &[2]);
        let sorted = table.sorted_by(|a, b| a.1.cmp(b.1));
        assert_eq!(sorted.iter().map(|(name, _)| *name).collect::<Vec<_>>(), vec!["b", "c", "a"]);
    }
}
