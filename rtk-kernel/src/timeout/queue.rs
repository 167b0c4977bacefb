//! Timeout queue
//!
//! Per-CPU priority queue of armed timeouts ordered by wakeup time. The
//! queue only orders references; the armed/hit flags live in the
//! [`Timeout`](rtk_core::Timeout) objects.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Ordering;

use rtk_core::{Time, TimeoutRef};

/// Entry in the timeout queue.
#[derive(Clone, Copy, Debug)]
struct TimeoutEntry {
    /// Absolute wakeup time.
    wakeup: Time,
    /// Timeout object reference.
    timeout: TimeoutRef,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wakeup == other.wakeup && self.timeout == other.timeout
    }
}

impl Eq for TimeoutEntry {}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for earliest wakeup first
        other
            .wakeup
            .cmp(&self.wakeup)
            .then_with(|| other.timeout.index().cmp(&self.timeout.index()))
    }
}

/// Min-heap of armed timeouts.
#[derive(Debug, Default)]
pub struct TimeoutQueue {
    heap: BinaryHeap<TimeoutEntry>,
}

impl TimeoutQueue {
    /// Create an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Queue `timeout` for `wakeup`.
    pub fn push(&mut self, timeout: TimeoutRef, wakeup: Time) {
        self.heap.push(TimeoutEntry { wakeup, timeout });
    }

    /// Remove every entry for `timeout`.
    ///
    /// O(n), but a CPU only has a handful of armed timeouts.
    pub fn remove(&mut self, timeout: TimeoutRef) {
        let entries: Vec<_> = self
            .heap
            .drain()
            .filter(|e| e.timeout != timeout)
            .collect();
        self.heap.extend(entries);
    }

    /// Pop the earliest timeout if its wakeup is not after `now`.
    pub fn pop_expired(&mut self, now: Time) -> Option<TimeoutRef> {
        match self.heap.peek() {
            Some(entry) if entry.wakeup <= now => self.heap.pop().map(|e| e.timeout),
            _ => None,
        }
    }

    /// Earliest wakeup time.
    #[must_use]
    pub fn next_wakeup(&self) -> Option<Time> {
        self.heap.peek().map(|e| e.wakeup)
    }

    /// Check if `timeout` is queued.
    #[must_use]
    pub fn contains(&self, timeout: TimeoutRef) -> bool {
        self.heap.iter().any(|e| e.timeout == timeout)
    }

    /// Number of queued timeouts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
