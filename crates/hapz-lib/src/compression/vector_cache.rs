//! Bounded cache of decoded unique vectors, evicted oldest-first.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct VectorCache {
    capacity: usize,
    order: VecDeque<u64>,
    entries: FxHashMap<u64, Vec<u8>>,
    hits: u64,
    misses: u64,
}

impl VectorCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1 << 16)),
            entries: FxHashMap::default(),
            hits: 0,
            misses: 0,
        }
    }

    /// Number of vectors that fit a `memory_mb` budget (0 = no budget),
    /// never more than `max_vectors`.
    pub fn capacity_for(memory_mb: u64, vec_len: usize, no_vec: u64, max_vectors: u64) -> usize {
        let by_budget = if memory_mb == 0 {
            no_vec
        } else {
            memory_mb.saturating_mul(1_000_000) / vec_len.max(1) as u64
        };
        by_budget.min(max_vectors) as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, unique: u64) -> Option<&[u8]> {
        match self.entries.get(&unique) {
            Some(v) => {
                self.hits += 1;
                Some(v.as_slice())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, unique: u64, bytes: Vec<u8>) {
        if self.capacity == 0 || self.entries.contains_key(&unique) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.entries.remove(&old);
                }
                None => break,
            }
        }
        self.order.push_back(unique);
        self.entries.insert(unique, bytes);
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
