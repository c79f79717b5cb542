//! Monotonic id allocation.

use std::cell::Cell;

/// Counter producing unique, strictly increasing ids.
///
/// Starts at 1 so that 0 never names a live stream or request, and wraps
/// back to 1 after `u64::MAX`.
#[derive(Debug)]
pub struct SequenceId {
    next_id: Cell<u64>,
}

impl SequenceId {
    /// Create a new counter starting from 1.
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id.checked_add(1).unwrap_or(1));
        id
    }

    /// Peek at the id the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> u64 {
        self.next_id.get()
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}
