//! Priority-ordered waiter queue.
//!
//! Entries are keyed by `(priority, sequence)`. The sequence is assigned at
//! enqueue time from a counter owned by the queue, so keys are unique and
//! the order is total: lower priority rank first, then earlier arrival.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::Priority;

/// Position of one waiter in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterKey {
    pub priority: Priority,
    pub sequence: u64,
}

impl Ord for WaiterKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for WaiterKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sorted collection of pending waiters.
///
/// Not synchronised; the gate only touches it while holding its state lock.
#[derive(Debug)]
pub struct WaiterQueue<T> {
    entries: BTreeMap<WaiterKey, T>,
    next_sequence: u64,
}

impl<T> WaiterQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// Insert in position and return the assigned key.
    pub fn push(&mut self, priority: Priority, waiter: T) -> WaiterKey {
        let key = WaiterKey {
            priority,
            sequence: self.next_sequence,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.entries.insert(key, waiter);
        key
    }

    /// Remove and return the most urgent waiter.
    pub fn pop_front(&mut self) -> Option<(WaiterKey, T)> {
        self.entries.pop_first()
    }

    /// Remove a specific waiter (timeout or abandonment). `None` if it was
    /// already taken by a release.
    pub fn remove(&mut self, key: &WaiterKey) -> Option<T> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for WaiterQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
