//! Descriptor rings.
//!
//! [`Ring`] is the fixed-size circular slot array shared by the RX and TX
//! rings. Wraparound is only ever computed here; callers move between slots
//! with [`Ring::next`], [`Ring::prev`] and [`Ring::advance`].

pub mod rx;
pub mod shadow;
pub mod tx;

use std::fmt;

/// Position of a slot in a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub fn get(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fixed-capacity circular array of slots.
pub struct Ring<T> {
    slots: Box<[T]>,
}

impl<T: Default> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Self {
            slots: (0..capacity).map(|_| T::default()).collect(),
        }
    }
}

impl<T> Ring<T> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn first(&self) -> SlotIndex {
        SlotIndex(0)
    }

    pub fn next(&self, slot: SlotIndex) -> SlotIndex {
        self.advance(slot, 1)
    }

    pub fn prev(&self, slot: SlotIndex) -> SlotIndex {
        if slot.0 == 0 {
            SlotIndex(self.slots.len() - 1)
        } else {
            SlotIndex(slot.0 - 1)
        }
    }

    pub fn advance(&self, slot: SlotIndex, n: usize) -> SlotIndex {
        SlotIndex((slot.0 + n % self.slots.len()) % self.slots.len())
    }

    /// Slots from `slot` (inclusive) forward to `other` (exclusive).
    pub fn distance(&self, slot: SlotIndex, other: SlotIndex) -> usize {
        (other.0 + self.slots.len() - slot.0) % self.slots.len()
    }

    pub fn get(&self, slot: SlotIndex) -> &T {
        &self.slots[slot.0]
    }

    pub fn get_mut(&mut self, slot: SlotIndex) -> &mut T {
        &mut self.slots[slot.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}
