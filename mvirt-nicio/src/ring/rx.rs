//! Receive descriptor ring.
//!
//! Every slot is either armed (it holds a buffer and belongs to the device)
//! or unarmed (software detached the buffer and has not refilled it yet).
//! The device fills armed slots strictly in ring order, so software takes
//! filled slots from `head` and re-arms from `tail`, the oldest unarmed slot.
//! Keeping refills in ring order keeps the device-visible armed region
//! contiguous even while some slots wait for a buffer.

use std::fmt;

use super::{Ring, SlotIndex};
use crate::pool::Buffer;

/// First descriptor of a frame.
pub const RX_F_DESC: u32 = 1 << 26;
/// Last descriptor of a frame.
pub const RX_L_DESC: u32 = 1 << 27;
/// Error summary.
pub const RX_ES: u32 = 1 << 16;
/// Error code, valid when [`RX_ES`] is set.
pub const RX_ERR_CODE_SHIFT: u32 = 17;
pub const RX_ERR_CODE_MASK: u32 = 0b11 << RX_ERR_CODE_SHIFT;
pub const RX_ERR_CRC: u32 = 0 << RX_ERR_CODE_SHIFT;
pub const RX_ERR_OVERRUN: u32 = 1 << RX_ERR_CODE_SHIFT;
pub const RX_ERR_LEN: u32 = 2 << RX_ERR_CODE_SHIFT;
pub const RX_ERR_RESOURCE: u32 = 3 << RX_ERR_CODE_SHIFT;
/// Layer-4 checksum verified by the device.
pub const RX_L4_CSUM_OK: u32 = 1 << 30;
/// Classifier marked the frame for special handling.
pub const RX_SPECIAL: u32 = 1 << 31;

/// Frame CRC included in the device-reported data size.
pub const RX_CRC_SIZE: usize = 4;

/// Receive error reported in a descriptor status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    Crc,
    Overrun,
    /// Frame too long for the buffer, or spread over several descriptors.
    Length,
    Resource,
}

impl fmt::Display for RxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RxError::Crc => write!(f, "bad CRC"),
            RxError::Overrun => write!(f, "overrun"),
            RxError::Length => write!(f, "bad length"),
            RxError::Resource => write!(f, "no resource"),
        }
    }
}

/// Classify a descriptor status word.
pub fn classify_status(status: u32) -> Result<(), RxError> {
    if status & (RX_F_DESC | RX_L_DESC) != (RX_F_DESC | RX_L_DESC) {
        return Err(RxError::Length);
    }
    if status & RX_ES == 0 {
        return Ok(());
    }
    Err(match status & RX_ERR_CODE_MASK {
        RX_ERR_CRC => RxError::Crc,
        RX_ERR_OVERRUN => RxError::Overrun,
        RX_ERR_LEN => RxError::Length,
        _ => RxError::Resource,
    })
}

#[derive(Default)]
struct RxSlot {
    buffer: Option<Buffer>,
}

pub struct RxRing {
    ring: Ring<RxSlot>,
    /// Next slot the device fills.
    head: SlotIndex,
    /// Next slot to re-arm.
    tail: SlotIndex,
    armed: usize,
}

impl RxRing {
    /// Create an empty ring; every slot starts unarmed.
    pub fn new(capacity: usize) -> Self {
        let ring = Ring::new(capacity);
        let first = ring.first();
        Self {
            ring,
            head: first,
            tail: first,
            armed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Slots owned by the device.
    pub fn non_occupied(&self) -> usize {
        self.armed
    }

    /// Slots held by software, waiting for a refill.
    pub fn occupied(&self) -> usize {
        self.ring.capacity() - self.armed
    }

    /// Slot the next [`RxRing::arm`] will fill, if any slot is unarmed.
    pub fn next_to_arm(&self) -> Option<SlotIndex> {
        (self.armed < self.ring.capacity()).then_some(self.tail)
    }

    /// Arm the oldest unarmed slot with `buffer`. Hands the buffer back if
    /// every slot is already armed.
    pub fn arm(&mut self, buffer: Buffer) -> Result<SlotIndex, Buffer> {
        if self.armed == self.ring.capacity() {
            return Err(buffer);
        }
        let slot = self.tail;
        let entry = self.ring.get_mut(slot);
        debug_assert!(entry.buffer.is_none());
        entry.buffer = Some(buffer);
        self.tail = self.ring.next(slot);
        self.armed += 1;
        Ok(slot)
    }

    /// Detach the buffer of the next filled slot. The caller must have
    /// confirmed through the device busy count that the slot is filled.
    pub fn next_filled(&mut self) -> Option<(SlotIndex, Buffer)> {
        if self.armed == 0 {
            return None;
        }
        let slot = self.head;
        let buffer = self.ring.get_mut(slot).buffer.take()?;
        self.head = self.ring.next(slot);
        self.armed -= 1;
        Some((slot, buffer))
    }

    /// Detach every armed buffer, leaving the ring empty.
    pub fn drain(&mut self) -> Vec<Buffer> {
        let mut out = Vec::with_capacity(self.armed);
        while let Some((_, buffer)) = self.next_filled() {
            out.push(buffer);
        }
        out
    }
}
