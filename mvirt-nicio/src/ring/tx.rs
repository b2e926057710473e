//! Transmit descriptor ring.
//!
//! Descriptors are acquired in batches (one batch per packet), written, and
//! then either committed, which makes them live until the device reports
//! them sent, or rolled back newest-first. One slot always stays free so a
//! full ring is distinguishable from an empty one.

use std::fmt;
use std::ops::BitOr;

use super::{Ring, SlotIndex};
use crate::error::{Error, Result};

/// Command bits of a TX descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxFlags(u32);

impl TxFlags {
    pub const NONE: TxFlags = TxFlags(0);
    /// First descriptor of a packet.
    pub const FIRST: TxFlags = TxFlags(1 << 21);
    /// Last descriptor of a packet.
    pub const LAST: TxFlags = TxFlags(1 << 20);
    /// Pad short frames to the Ethernet minimum.
    pub const PAD: TxFlags = TxFlags(1 << 19);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: TxFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TxFlags {
    type Output = TxFlags;

    fn bitor(self, rhs: TxFlags) -> TxFlags {
        TxFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TxFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(TxFlags::FIRST) {
            parts.push("F");
        }
        if self.contains(TxFlags::LAST) {
            parts.push("L");
        }
        if self.contains(TxFlags::PAD) {
            parts.push("Z");
        }
        write!(f, "[{}]", parts.join("|"))
    }
}

/// Flags of descriptor `i` of a packet spanning `count` descriptors.
pub fn fragment_flags(i: usize, count: usize, pad: bool) -> TxFlags {
    let mut flags = TxFlags::NONE;
    if i == 0 {
        flags = flags | TxFlags::FIRST;
    }
    if i + 1 == count {
        flags = flags | TxFlags::LAST;
        if pad {
            flags = flags | TxFlags::PAD;
        }
    }
    flags
}

/// A device-visible TX descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxDescriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: TxFlags,
}

/// Descriptors reserved for one packet.
#[derive(Debug, Clone, Copy)]
pub struct TxBatch {
    first: SlotIndex,
    count: usize,
}

impl TxBatch {
    pub fn first(&self) -> SlotIndex {
        self.first
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

pub struct TxRing {
    ring: Ring<TxDescriptor>,
    /// Next slot to hand out.
    put: SlotIndex,
    /// Oldest live descriptor.
    done: SlotIndex,
    /// Committed descriptors the device has not reported sent.
    live: usize,
    /// Acquired but neither committed nor rolled back.
    reserved: usize,
}

impl TxRing {
    pub fn new(capacity: usize) -> Self {
        let ring = Ring::new(capacity);
        let put = ring.first();
        Self {
            ring,
            put,
            done: put,
            live: 0,
            reserved: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Descriptors that can still be acquired.
    pub fn available(&self) -> usize {
        self.ring.capacity() - 1 - self.live - self.reserved
    }

    /// Slots between the oldest live descriptor and the next one to hand
    /// out, reserved batches included.
    pub fn occupied(&self) -> usize {
        self.ring.distance(self.done, self.put)
    }

    /// Free slots, the sentinel included.
    pub fn non_occupied(&self) -> usize {
        self.available() + 1
    }

    /// Reserve `n` consecutive descriptors.
    pub fn acquire(&mut self, n: usize) -> Result<TxBatch> {
        if self.live + self.reserved + n >= self.ring.capacity() {
            return Err(Error::ResourceExhausted(format!(
                "{n} TX descriptors requested, {} available",
                self.available()
            )));
        }
        let batch = TxBatch {
            first: self.put,
            count: n,
        };
        self.put = self.ring.advance(self.put, n);
        self.reserved += n;
        Ok(batch)
    }

    /// Slot of descriptor `i` of `batch`.
    pub fn slot(&self, batch: &TxBatch, i: usize) -> SlotIndex {
        debug_assert!(i < batch.count);
        self.ring.advance(batch.first, i)
    }

    pub fn write(&mut self, slot: SlotIndex, desc: TxDescriptor) {
        *self.ring.get_mut(slot) = desc;
    }

    pub fn descriptor(&self, slot: SlotIndex) -> &TxDescriptor {
        self.ring.get(slot)
    }

    /// Make the batch live.
    pub fn commit(&mut self, batch: TxBatch) {
        self.reserved -= batch.count;
        self.live += batch.count;
    }

    /// Return the batch's descriptors, newest first.
    pub fn rollback(&mut self, batch: TxBatch) {
        for _ in 0..batch.count {
            self.put = self.ring.prev(self.put);
            *self.ring.get_mut(self.put) = TxDescriptor::default();
        }
        debug_assert_eq!(self.put, batch.first);
        self.reserved -= batch.count;
    }

    /// The device reported `n` descriptors sent.
    pub fn complete(&mut self, n: usize) {
        debug_assert!(n <= self.live);
        let n = n.min(self.live);
        self.done = self.ring.advance(self.done, n);
        self.live -= n;
    }

    /// Forget every descriptor, live or not.
    pub fn reset(&mut self) {
        self.put = self.ring.first();
        self.done = self.put;
        self.live = 0;
        self.reserved = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_keeps_one_slot_free() {
        let mut ring = TxRing::new(8);
        let batch = ring.acquire(7);
        assert!(matches!(batch, Err(Error::ResourceExhausted(_))));

        let batch = ring.acquire(6).unwrap();
        ring.commit(batch);
        assert_eq!(ring.live(), 6);
        assert_eq!(ring.available(), 1);
        assert!(ring.acquire(1).is_err());
    }

    #[test]
    fn test_batches_are_consecutive() {
        let mut ring = TxRing::new(8);
        let a = ring.acquire(3).unwrap();
        ring.commit(a);
        let b = ring.acquire(2).unwrap();
        assert_eq!(b.first().get(), 3);
        assert_eq!(ring.slot(&b, 1).get(), 4);
    }

    #[test]
    fn test_rollback_restores_put() {
        let mut ring = TxRing::new(8);
        let a = ring.acquire(2).unwrap();
        ring.commit(a);

        let b = ring.acquire(3).unwrap();
        for i in 0..3 {
            let slot = ring.slot(&b, i);
            ring.write(
                slot,
                TxDescriptor {
                    addr: 0x1000,
                    len: 64,
                    flags: TxFlags::FIRST,
                },
            );
        }
        ring.rollback(b);
        assert_eq!(ring.live(), 2);
        assert_eq!(ring.available(), 5);
        assert_eq!(*ring.descriptor(b.first()), TxDescriptor::default());

        let c = ring.acquire(1).unwrap();
        assert_eq!(c.first(), b.first());
    }

    #[test]
    fn test_wraparound() {
        let mut ring = TxRing::new(4);
        let a = ring.acquire(3).unwrap();
        ring.commit(a);
        ring.complete(3);
        let b = ring.acquire(2).unwrap();
        assert_eq!(b.first().get(), 3);
        assert_eq!(ring.slot(&b, 1).get(), 0);
    }

    #[test]
    fn test_occupancy_invariant() {
        let mut ring = TxRing::new(8);
        let check = |r: &TxRing| assert_eq!(r.occupied() + r.non_occupied(), r.capacity());
        check(&ring);
        assert_eq!(ring.non_occupied(), 8);

        let a = ring.acquire(4).unwrap();
        check(&ring);
        ring.commit(a);
        check(&ring);
        assert_eq!(ring.occupied(), 4);

        let b = ring.acquire(3).unwrap();
        check(&ring);
        ring.rollback(b);
        check(&ring);
        assert_eq!(ring.occupied(), 4);

        ring.complete(3);
        check(&ring);
        assert_eq!(ring.occupied(), 1);

        // put wraps past the end while the oldest live slot is #3
        let c = ring.acquire(6).unwrap();
        assert_eq!(ring.slot(&c, 5).get(), 1);
        check(&ring);
        ring.commit(c);
        check(&ring);
        assert_eq!(ring.non_occupied(), 1);

        ring.complete(7);
        check(&ring);
        assert_eq!(ring.occupied(), 0);

        let d = ring.acquire(2).unwrap();
        ring.commit(d);
        ring.reset();
        check(&ring);
        assert_eq!(ring.non_occupied(), 8);
    }

    #[test]
    fn test_fragment_flags() {
        let single = fragment_flags(0, 1, true);
        assert_eq!(single, TxFlags::FIRST | TxFlags::LAST | TxFlags::PAD);
        assert_eq!(fragment_flags(0, 1, false), TxFlags::FIRST | TxFlags::LAST);

        assert_eq!(fragment_flags(0, 3, true), TxFlags::FIRST);
        assert_eq!(fragment_flags(1, 3, true), TxFlags::NONE);
        assert_eq!(fragment_flags(2, 3, true), TxFlags::LAST | TxFlags::PAD);
        assert_eq!(fragment_flags(2, 3, true).to_string(), "[L|Z]");
    }
}
