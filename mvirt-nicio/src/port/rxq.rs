//! RX queue: descriptor ring plus refill and drain logic.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use super::Event;
use crate::device::DeviceRegisters;
use crate::error::Error;
use crate::ids::PortId;
use crate::packet::{RxFrame, is_pause_frame};
use crate::pool::{Buffer, BufferPool};
use crate::ring::rx::{
    RX_CRC_SIZE, RX_L4_CSUM_OK, RX_SPECIAL, RxError, RxRing, classify_status,
};

#[derive(Debug, Clone, Serialize)]
pub struct RxQueueStats {
    pub index: usize,
    pub size: usize,
    pub priority: u8,
    pub armed: usize,
    /// Slots waiting for a buffer.
    pub holes: usize,
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    /// Refills that found the pool empty.
    pub missed: u64,
    pub pause: u64,
    pub special: u64,
    pub crc_errors: u64,
    pub overrun_errors: u64,
    pub length_errors: u64,
    pub resource_errors: u64,
    pub refilled: u64,
    /// Most recent device-reported receive error.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    packets: u64,
    bytes: u64,
    dropped: u64,
    missed: u64,
    pause: u64,
    special: u64,
    crc: u64,
    overrun: u64,
    length: u64,
    resource: u64,
    refilled: u64,
    last_error: Option<RxError>,
}

/// Per-port knobs a drain needs.
pub(crate) struct DrainCtx {
    pub port: PortId,
    pub special_hook: bool,
    pub debug: bool,
}

/// Outcome of one [`RxQueue::drain`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RxDrain {
    pub processed: usize,
    pub refilled: usize,
    /// Some slot could not be refilled.
    pub deferred: bool,
}

pub struct RxQueue {
    index: usize,
    size: usize,
    priority: u8,
    ring: Option<RxRing>,
    counters: Counters,
}

impl RxQueue {
    pub fn new(index: usize, size: usize, priority: Option<u8>) -> Self {
        Self {
            index,
            size,
            priority: priority.unwrap_or(index as u8),
            ring: None,
            counters: Counters::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        debug_assert!(self.ring.is_none());
        self.size = size;
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    pub fn is_open(&self) -> bool {
        self.ring.is_some()
    }

    /// Slots armed with a buffer.
    pub fn armed(&self) -> usize {
        self.ring.as_ref().map_or(0, RxRing::non_occupied)
    }

    /// Slots waiting for a refill.
    pub fn holes(&self) -> usize {
        self.ring.as_ref().map_or(0, RxRing::occupied)
    }

    /// Create the ring and arm as many slots as the pool allows. Returns
    /// true if every slot was armed.
    pub fn open(&mut self, dev: &mut dyn DeviceRegisters, pool: &Arc<BufferPool>) -> bool {
        self.ring = Some(RxRing::new(self.size));
        let (refilled, complete) = self.fill(dev, pool);
        dev.rx_update(self.index, 0, refilled);
        complete
    }

    /// Free the ring. Every buffer it held goes back to its pool.
    pub fn close(&mut self) -> usize {
        let Some(mut ring) = self.ring.take() else {
            return 0;
        };
        ring.drain().len()
    }

    /// Arm unarmed slots in ring order until the ring is full or the pool
    /// runs dry. Does not publish to the device.
    fn fill(&mut self, dev: &mut dyn DeviceRegisters, pool: &Arc<BufferPool>) -> (usize, bool) {
        let Some(ring) = self.ring.as_mut() else {
            return (0, true);
        };
        let mut refilled = 0;
        while ring.next_to_arm().is_some() {
            let Ok(buffer) = pool.get() else {
                self.counters.missed += 1;
                self.counters.refilled += refilled as u64;
                return (refilled, false);
            };
            arm(ring, dev, self.index, buffer);
            refilled += 1;
        }
        self.counters.refilled += refilled as u64;
        (refilled, true)
    }

    /// Retry path: arm deferred slots. Returns the slots still unarmed.
    pub fn refill_deferred(&mut self, dev: &mut dyn DeviceRegisters, pool: &Arc<BufferPool>) -> usize {
        let (refilled, _) = self.fill(dev, pool);
        if refilled > 0 {
            dev.rx_update(self.index, 0, refilled);
        }
        self.holes()
    }

    /// Process up to `budget` filled descriptors.
    pub(crate) fn drain(
        &mut self,
        dev: &mut dyn DeviceRegisters,
        pool: &Arc<BufferPool>,
        budget: usize,
        ctx: &DrainCtx,
        events: &mut Vec<Event>,
    ) -> RxDrain {
        let (mut refilled, complete) = self.fill(dev, pool);
        let mut out = RxDrain {
            deferred: !complete,
            ..Default::default()
        };
        let Some(ring) = self.ring.as_mut() else {
            return out;
        };
        let c = &mut self.counters;
        let rxq = self.index;

        let todo = dev.rx_busy(rxq).min(budget).min(ring.non_occupied());
        for _ in 0..todo {
            let Some((slot, mut buffer)) = ring.next_filled() else {
                break;
            };
            out.processed += 1;
            let desc = dev.rx_status(rxq, slot);

            if let Err(err) = classify_status(desc.status) {
                c.dropped += 1;
                match err {
                    RxError::Crc => c.crc += 1,
                    RxError::Overrun => c.overrun += 1,
                    RxError::Length => c.length += 1,
                    RxError::Resource => c.resource += 1,
                }
                c.last_error = Some(err);
                debug!(port = %ctx.port, rxq, %slot, error = %err, status = format_args!("{:#010x}", desc.status), "RX error");
                // Re-arm with a fresh buffer; the dropped one only goes back
                // into the ring if the pool has nothing else.
                let replacement = match pool.get() {
                    Ok(fresh) => {
                        drop(buffer);
                        fresh
                    }
                    Err(_) => buffer,
                };
                arm(ring, dev, rxq, replacement);
                refilled += 1;
                c.refilled += 1;
                continue;
            }

            let len = (desc.data_size as usize).saturating_sub(RX_CRC_SIZE);
            buffer.set_len(len);

            if is_pause_frame(buffer.data()) {
                c.pause += 1;
                c.dropped += 1;
                arm(ring, dev, rxq, buffer);
                refilled += 1;
                c.refilled += 1;
                continue;
            }

            c.packets += 1;
            c.bytes += len as u64;
            if ctx.debug {
                trace!(port = %ctx.port, rxq, %slot, len, buffer = %buffer.handle(), "RX frame");
            }

            let frame = RxFrame::new(buffer, rxq, desc.status & RX_L4_CSUM_OK != 0);
            if ctx.special_hook && desc.status & RX_SPECIAL != 0 {
                c.special += 1;
                events.push(Event::Special(frame));
            } else {
                events.push(Event::Frame(frame));
            }

            match pool.get() {
                Ok(fresh) => {
                    arm(ring, dev, rxq, fresh);
                    refilled += 1;
                    c.refilled += 1;
                }
                Err(_) => {
                    c.missed += 1;
                    out.deferred = true;
                }
            }
        }

        dev.rx_update(rxq, out.processed, refilled);
        out.refilled = refilled;
        out
    }

    pub fn stats(&self) -> RxQueueStats {
        let c = &self.counters;
        RxQueueStats {
            index: self.index,
            size: self.size,
            priority: self.priority,
            armed: self.armed(),
            holes: self.holes(),
            packets: c.packets,
            bytes: c.bytes,
            dropped: c.dropped,
            missed: c.missed,
            pause: c.pause,
            special: c.special,
            crc_errors: c.crc,
            overrun_errors: c.overrun,
            length_errors: c.length,
            resource_errors: c.resource,
            refilled: c.refilled,
            last_error: c.last_error.map(|err| Error::HardwareStatus(err).to_string()),
        }
    }
}

fn arm(ring: &mut RxRing, dev: &mut dyn DeviceRegisters, rxq: usize, buffer: Buffer) {
    let addr = buffer.dma_addr();
    let room = buffer.room();
    // Only called with a free slot: either one just processed or one
    // reported by next_to_arm.
    if let Ok(slot) = ring.arm(buffer) {
        dev.arm_descriptor(rxq, slot, addr, room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PoolId;
    use crate::ring::rx::{RX_ERR_CRC, RX_ES, RX_F_DESC, RX_L_DESC};
    use crate::test_util::SimDevice;
    use crate::test_util::packets::{ipv4_frame, pause_frame};

    const CTX: DrainCtx = DrainCtx {
        port: PortId(0),
        special_hook: false,
        debug: true,
    };

    fn setup(size: usize, capacity: usize) -> (RxQueue, SimDevice, Arc<BufferPool>) {
        let pool = BufferPool::new(PoolId(0), 2048, capacity).unwrap();
        let mut dev = SimDevice::new(1);
        let mut rxq = RxQueue::new(0, size, None);
        rxq.open(&mut dev, &pool);
        (rxq, dev, pool)
    }

    fn frames(events: Vec<Event>) -> Vec<RxFrame> {
        events
            .into_iter()
            .filter_map(|e| match e {
                Event::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_open_arms_every_slot() {
        let (rxq, dev, pool) = setup(8, 16);
        assert_eq!(rxq.armed(), 8);
        assert_eq!(rxq.holes(), 0);
        assert_eq!(dev.armed(0), 8);
        assert_eq!(pool.outstanding(), 8);
    }

    #[test]
    fn test_drain_delivers_and_refills() {
        let (mut rxq, mut dev, pool) = setup(4, 16);
        let frame = ipv4_frame(0, 100);
        dev.inject_rx(0, &frame);
        dev.inject_rx(0, &frame);

        let mut events = Vec::new();
        let out = rxq.drain(&mut dev, &pool, 64, &CTX, &mut events);
        assert_eq!(out.processed, 2);
        assert_eq!(out.refilled, 2);
        assert!(!out.deferred);

        let frames = frames(events);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data(), &frame[..]);
        assert_eq!(rxq.armed(), 4);
        assert_eq!(dev.armed(0), 4);
        assert_eq!(pool.outstanding(), 6);
    }

    #[test]
    fn test_drain_respects_budget() {
        let (mut rxq, mut dev, pool) = setup(8, 32);
        for _ in 0..5 {
            dev.inject_rx(0, &ipv4_frame(0, 60));
        }
        let mut events = Vec::new();
        assert_eq!(rxq.drain(&mut dev, &pool, 3, &CTX, &mut events).processed, 3);
        assert_eq!(rxq.drain(&mut dev, &pool, 3, &CTX, &mut events).processed, 2);
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn test_crc_error_refills_with_new_buffer() {
        let (mut rxq, mut dev, pool) = setup(4, 16);
        pool.fill(16);
        dev.inject_rx_status(0, RX_F_DESC | RX_L_DESC | RX_ES | RX_ERR_CRC, 64);
        let bad = dev.filled_addr(0).unwrap();

        let mut events = Vec::new();
        let out = rxq.drain(&mut dev, &pool, 64, &CTX, &mut events);
        assert!(events.is_empty());
        assert_eq!(out.processed, 1);

        let stats = rxq.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.crc_errors, 1);
        assert_eq!(
            stats.last_error.as_deref(),
            Some("Device reported receive error: bad CRC")
        );
        assert_eq!(rxq.armed() + rxq.holes(), 4);
        assert_eq!(rxq.armed(), 4);
        assert!(!dev.armed_addrs(0).contains(&bad));
        assert_eq!(pool.outstanding(), 4);
    }

    #[test]
    fn test_error_rearms_old_buffer_when_pool_empty() {
        let (mut rxq, mut dev, pool) = setup(4, 4);
        dev.inject_rx_status(0, RX_F_DESC, 64);
        let bad = dev.filled_addr(0).unwrap();

        let mut events = Vec::new();
        rxq.drain(&mut dev, &pool, 64, &CTX, &mut events);
        assert_eq!(rxq.stats().length_errors, 1);
        assert_eq!(rxq.armed(), 4);
        assert!(dev.armed_addrs(0).contains(&bad));
    }

    #[test]
    fn test_pause_frame_dropped() {
        let (mut rxq, mut dev, pool) = setup(4, 8);
        dev.inject_rx(0, &pause_frame());
        let mut events = Vec::new();
        rxq.drain(&mut dev, &pool, 64, &CTX, &mut events);
        assert!(events.is_empty());
        assert_eq!(rxq.stats().pause, 1);
        assert_eq!(rxq.armed(), 4);
    }

    #[test]
    fn test_exhausted_pool_defers_refill() {
        let (mut rxq, mut dev, pool) = setup(4, 4);
        dev.inject_rx(0, &ipv4_frame(0, 60));
        dev.inject_rx(0, &ipv4_frame(0, 60));

        let mut events = Vec::new();
        let out = rxq.drain(&mut dev, &pool, 64, &CTX, &mut events);
        assert!(out.deferred);
        assert_eq!(rxq.holes(), 2);
        assert_eq!(rxq.stats().missed, 2);
        assert_eq!(rxq.stats().last_error, None);

        drop(events);
        assert_eq!(rxq.refill_deferred(&mut dev, &pool), 0);
        assert_eq!(dev.armed(0), 4);
    }

    #[test]
    fn test_partial_refill_is_counted() {
        let (mut rxq, mut dev, pool) = setup(4, 6);
        assert_eq!(rxq.stats().refilled, 4);
        for _ in 0..4 {
            dev.inject_rx(0, &ipv4_frame(0, 60));
        }

        let mut events = Vec::new();
        rxq.drain(&mut dev, &pool, 64, &CTX, &mut events);
        assert_eq!(rxq.holes(), 2);
        assert_eq!(rxq.stats().refilled, 6);

        // One frame back: the next fill arms a single slot, then runs dry
        drop(events.pop());
        let (refilled, complete) = rxq.fill(&mut dev, &pool);
        assert_eq!((refilled, complete), (1, false));
        assert_eq!(rxq.stats().refilled, 7);
        assert_eq!(rxq.holes(), 1);
    }

    #[test]
    fn test_special_frames_routed_when_hooked() {
        let (mut rxq, mut dev, pool) = setup(4, 8);
        dev.inject_rx_with(0, &ipv4_frame(0, 60), RX_SPECIAL | RX_L4_CSUM_OK);
        dev.inject_rx_with(0, &ipv4_frame(0, 60), RX_SPECIAL);

        let ctx = DrainCtx {
            special_hook: true,
            ..CTX
        };
        let mut events = Vec::new();
        rxq.drain(&mut dev, &pool, 1, &ctx, &mut events);
        assert!(matches!(&events[0], Event::Special(f) if f.l4_csum_ok()));

        // Without a hook the bit is ignored.
        rxq.drain(&mut dev, &pool, 1, &CTX, &mut events);
        assert!(matches!(&events[1], Event::Frame(_)));
        assert_eq!(rxq.stats().special, 1);
    }

    #[test]
    fn test_close_returns_buffers() {
        let (mut rxq, _dev, pool) = setup(8, 8);
        assert_eq!(rxq.close(), 8);
        assert_eq!(pool.outstanding(), 0);
        assert!(!rxq.is_open());
    }
}
