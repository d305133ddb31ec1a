//! QPACK dynamic table with absolute indexing (RFC 9204 §3.2).

use std::collections::VecDeque;

use crate::error::H3Error;

use super::ENTRY_OVERHEAD;

/// Insertion-ordered entry store; the oldest entries evict first.
///
/// Absolute index 0 is the first entry ever inserted; `insert_count` is
/// the absolute index the next insertion will take.
#[derive(Debug, Default)]
pub struct DynamicTable {
    entries: VecDeque<(String, String)>,
    /// Absolute index of `entries[0]`.
    dropped: u64,
    size: u64,
    capacity: u64,
}

impl DynamicTable {
    pub fn insert_count(&self) -> u64 {
        self.dropped + self.entries.len() as u64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of entries the configured capacity admits at minimum size;
    /// the modulus base for Required Insert Count encoding.
    pub fn max_entries(&self) -> u64 {
        self.capacity / ENTRY_OVERHEAD
    }

    fn entry_size(name: &str, value: &str) -> u64 {
        name.len() as u64 + value.len() as u64 + ENTRY_OVERHEAD
    }

    pub fn set_capacity(&mut self, capacity: u64) {
        self.capacity = capacity;
        self.evict_to(capacity);
    }

    fn evict_to(&mut self, limit: u64) {
        while self.size > limit {
            let Some((name, value)) = self.entries.pop_front() else { break };
            self.size -= Self::entry_size(&name, &value);
            self.dropped += 1;
        }
    }

    /// Insert an entry, evicting as needed. Returns its absolute index.
    pub fn insert(&mut self, name: &str, value: &str) -> Result<u64, H3Error> {
        let size = Self::entry_size(name, value);
        if size > self.capacity {
            return Err(H3Error::QpackEncoderStream("entry larger than capacity"));
        }
        self.evict_to(self.capacity - size);
        let index = self.insert_count();
        self.entries.push_back((name.to_string(), value.to_string()));
        self.size += size;
        Ok(index)
    }

    /// Entry by absolute index; `None` if evicted or not yet inserted.
    pub fn get(&self, absolute: u64) -> Option<(&str, &str)> {
        if absolute < self.dropped {
            return None;
        }
        let idx = usize::try_from(absolute - self.dropped).ok()?;
        self.entries.get(idx).map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Exact-match search; returns the newest matching absolute index.
    pub fn find(&self, name: &str, value: &str) -> Option<u64> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, (n, v))| n == name && v == value)
            .map(|(i, _)| self.dropped + i as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_absolute_get() {
        let mut table = DynamicTable::default();
        table.set_capacity(4096);
        assert_eq!(table.insert("x-a", "1").unwrap(), 0);
        assert_eq!(table.insert("x-b", "2").unwrap(), 1);
        assert_eq!(table.get(0), Some(("x-a", "1")));
        assert_eq!(table.get(1), Some(("x-b", "2")));
        assert_eq!(table.insert_count(), 2);
    }

    #[test]
    fn test_eviction_in_insertion_order() {
        let mut table = DynamicTable::default();
        // Room for exactly two minimal entries.
        table.set_capacity(2 * (ENTRY_OVERHEAD + 4));
        table.insert("x-a", "1").unwrap();
        table.insert("x-b", "2").unwrap();
        table.insert("x-c", "3").unwrap();
        assert_eq!(table.get(0), None, "oldest entry evicted");
        assert_eq!(table.get(2), Some(("x-c", "3")));
        assert_eq!(table.insert_count(), 3);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let mut table = DynamicTable::default();
        table.set_capacity(40);
        assert!(table.insert("x-very-long-name", "with-a-long-value").is_err());
    }

    #[test]
    fn test_capacity_shrink_evicts() {
        let mut table = DynamicTable::default();
        table.set_capacity(4096);
        table.insert("x-a", "1").unwrap();
        table.insert("x-b", "2").unwrap();
        table.set_capacity(0);
        assert_eq!(table.size(), 0);
        assert_eq!(table.get(1), None);
        // Insert count survives eviction.
        assert_eq!(table.insert_count(), 2);
    }

    #[test]
    fn test_find_returns_newest() {
        let mut table = DynamicTable::default();
        table.set_capacity(4096);
        table.insert("x-a", "1").unwrap();
        table.insert("x-a", "1").unwrap();
        assert_eq!(table.find("x-a", "1"), Some(1));
        assert_eq!(table.find("x-a", "2"), None);
    }
}
