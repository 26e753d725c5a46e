//! Open-addressed tables of vector ids with tombstone deletion.
//!
//! The table stores ids only; callers compute the hash from the vector data
//! and verify candidates themselves. Probing is linear.

use rustc_hash::FxHasher;
use std::hash::Hasher;

const EMPTY: u32 = u32::MAX;
const REMOVED: u32 = u32::MAX - 1;

#[derive(Debug, Clone)]
pub struct IdTable {
    slots: Vec<u32>,
    mask: usize,
    /// Slots that are not `EMPTY` (live entries plus tombstones).
    filled: usize,
    live: usize,
}

impl IdTable {
    /// `size` is rounded up to a power of two.
    pub fn new(size: usize) -> Self {
        let size = size.max(16).next_power_of_two();
        Self {
            slots: vec![EMPTY; size],
            mask: size - 1,
            filled: 0,
            live: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn clear(&mut self) {
        self.slots.fill(EMPTY);
        self.filled = 0;
        self.live = 0;
    }

    /// True once live entries plus tombstones pass half the slots.
    #[inline]
    pub fn needs_rebuild(&self) -> bool {
        self.filled * 2 > self.slots.len()
    }

    /// Drop tombstones and re-insert `entries`, doubling first if the live
    /// set alone fills more than a quarter of the table.
    pub fn rebuild(&mut self, entries: impl IntoIterator<Item = (u64, u32)>) {
        let size = if self.live * 4 > self.slots.len() {
            self.slots.len() * 2
        } else {
            self.slots.len()
        };
        self.slots = vec![EMPTY; size];
        self.mask = size - 1;
        self.filled = 0;
        self.live = 0;
        for (hash, id) in entries {
            self.insert(hash, id);
        }
    }

    pub fn insert(&mut self, hash: u64, id: u32) {
        debug_assert!(id < REMOVED);
        let mut slot = hash as usize & self.mask;
        loop {
            match self.slots[slot] {
                EMPTY => {
                    self.filled += 1;
                    break;
                }
                REMOVED => break,
                _ => slot = (slot + 1) & self.mask,
            }
        }
        self.slots[slot] = id;
        self.live += 1;
    }

    /// Tombstone `id` under `hash`. Returns false when it was not present.
    pub fn remove(&mut self, hash: u64, id: u32) -> bool {
        let mut slot = hash as usize & self.mask;
        loop {
            match self.slots[slot] {
                EMPTY => return false,
                s if s == id => {
                    self.slots[slot] = REMOVED;
                    self.live -= 1;
                    return true;
                }
                _ => slot = (slot + 1) & self.mask,
            }
        }
    }

    /// Ids stored in the probe chain of `hash`, in probe order.
    pub fn probe(&self, hash: u64) -> Probe<'_> {
        Probe {
            table: self,
            slot: hash as usize & self.mask,
            steps: 0,
        }
    }
}

pub struct Probe<'a> {
    table: &'a IdTable,
    slot: usize,
    steps: usize,
}

impl Iterator for Probe<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while self.steps < self.table.slots.len() {
            let v = self.table.slots[self.slot];
            self.slot = (self.slot + 1) & self.table.mask;
            self.steps += 1;
            match v {
                EMPTY => {
                    self.steps = self.table.slots.len();
                    return None;
                }
                REMOVED => continue,
                id => return Some(id),
            }
        }
        None
    }
}

/// Hash of a byte window, for both key and whole-vector tables.
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_probe_remove() {
        let mut t = IdTable::new(16);
        t.insert(3, 10);
        t.insert(3, 11);
        t.insert(4, 12);
        let ids: Vec<u32> = t.probe(3).collect();
        assert_eq!(ids, vec![10, 11, 12]);

        assert!(t.remove(3, 11));
        assert!(!t.remove(3, 11));
        let ids: Vec<u32> = t.probe(3).collect();
        assert_eq!(ids, vec![10, 12]);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_tombstones_are_reused() {
        let mut t = IdTable::new(16);
        t.insert(0, 1);
        t.remove(0, 1);
        t.insert(0, 2);
        assert_eq!(t.probe(0).collect::<Vec<_>>(), vec![2]);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_rebuild_doubles_when_crowded() {
        let mut t = IdTable::new(16);
        for id in 0..9u32 {
            t.insert(u64::from(id) * 7, id);
        }
        assert!(t.needs_rebuild());
        let entries: Vec<(u64, u32)> = (0..9u32).map(|id| (u64::from(id) * 7, id)).collect();
        t.rebuild(entries);
        assert_eq!(t.capacity(), 32);
        assert!(!t.needs_rebuild());
        for id in 0..9u32 {
            assert!(t.probe(u64::from(id) * 7).any(|x| x == id));
        }
    }

    #[test]
    fn test_rebuild_drops_tombstones_without_growing() {
        let mut t = IdTable::new(16);
        for id in 0..9u32 {
            t.insert(u64::from(id), id);
        }
        for id in 0..7u32 {
            t.remove(u64::from(id), id);
        }
        assert!(t.needs_rebuild());
        t.rebuild([(7u64, 7u32), (8, 8)]);
        assert_eq!(t.capacity(), 16);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_probe_terminates_on_full_table() {
        let mut t = IdTable::new(16);
        for id in 0..16u32 {
            t.insert(0, id);
        }
        assert_eq!(t.probe(5).count(), 16);
    }

    #[test]
    fn test_hash_is_fx_over_the_window() {
        let key = [7u8, 0, 255, 3, 9];
        let mut hasher = FxHasher::default();
        hasher.write(&key);
        assert_eq!(hash_bytes(&key), hasher.finish());
    }

    #[test]
    fn test_hash_depends_on_every_byte() {
        let a = hash_bytes(&[1, 2, 3, 4, 5]);
        assert_ne!(a, hash_bytes(&[1, 2, 3, 4, 6]));
        assert_ne!(a, hash_bytes(&[0, 2, 3, 4, 5]));
    }
}
