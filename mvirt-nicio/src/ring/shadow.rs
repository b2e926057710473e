//! Shadow queue of a TX ring.
//!
//! One entry per TX descriptor, pushed and popped in the same order the
//! device completes descriptors. Only the last descriptor of a packet
//! carries something to release; the others hold [`ShadowEntry::Empty`].

use std::collections::VecDeque;

use crate::ids::PayloadToken;
use crate::pool::Buffer;

/// What to release once the descriptor's transmission completes.
#[derive(Debug)]
pub enum ShadowEntry {
    Empty,
    /// Pool buffer, returned to its pool.
    PoolBuffer(Buffer),
    /// Payload owned by the network stack, handed back through the release
    /// callback.
    External(PayloadToken),
}

impl ShadowEntry {
    pub fn is_empty(&self) -> bool {
        matches!(self, ShadowEntry::Empty)
    }
}

pub struct ShadowQueue {
    entries: VecDeque<ShadowEntry>,
    capacity: usize,
}

impl ShadowQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the entry of the descriptor just written. The TX ring bounds
    /// the number of entries, one per acquired descriptor.
    pub fn push(&mut self, entry: ShadowEntry) {
        debug_assert!(self.entries.len() < self.capacity);
        self.entries.push_back(entry);
    }

    /// Undo the most recent [`ShadowQueue::push`].
    pub fn unpush(&mut self) -> Option<ShadowEntry> {
        self.entries.pop_back()
    }

    /// Oldest entry, in completion order.
    pub fn pop(&mut self) -> Option<ShadowEntry> {
        self.entries.pop_front()
    }
}
