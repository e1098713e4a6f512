//! Ring buffer of compressed sample batches (C4, §4.4).
//!
//! Fixed capacity, overwrite-oldest, never blocks and never fails a push.

use std::collections::VecDeque;

/// One compressed-or-raw batch plus its bookkeeping (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub frame: Vec<u8>,
    pub sample_count: usize,
    pub enqueued_at_ms: u64,
}

/// Fixed-capacity FIFO. `push` never fails; once full it silently drops
/// the oldest entry to make room for the newest.
pub struct RingBuffer {
    capacity: usize,
    entries: VecDeque<Entry>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, entry: Entry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return all entries in FIFO order and empty the buffer in one step.
    pub fn drain_all(&mut self) -> Vec<Entry> {
        self.entries.drain(..).collect()
    }
}
