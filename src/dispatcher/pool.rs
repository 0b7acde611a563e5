//! Pool bookkeeping
//!
//! A `Pool` holds the identities of the messages the dispatcher currently
//! owns: offered and waiting for a modem, in flight on a modem, or waiting
//! for a retry decision. Admission is refused once `capacity` is reached.
//!
//! Only the dispatcher task touches a `Pool`, so it needs no locking.

use std::collections::HashSet;

#[derive(Debug)]
pub struct Pool {
    ids: HashSet<String>,
    capacity: usize,
    low_water: usize,
}

impl Pool {
    /// Create an empty pool. A zero capacity is treated as one.
    pub fn new(capacity: usize, low_water: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: HashSet::with_capacity(capacity),
            capacity,
            low_water,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ids.len() >= self.capacity
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Add an identity. Returns false if it is already pooled or the pool is full.
    pub fn admit(&mut self, id: &str) -> bool {
        if self.is_full() || self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string())
    }

    /// Remove an identity. Returns false if it was not pooled.
    pub fn release(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    /// Whether a refill should run now: the pool went idle, or it dropped
    /// below the low-water mark while the store has more than fits.
    pub fn needs_refill(&self, backlogged: bool) -> bool {
        self.ids.is_empty() || (backlogged && self.ids.len() < self.low_water)
    }
}
