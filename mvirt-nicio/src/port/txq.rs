//! TX queue: descriptor ring, shadow queue and scheduling state.

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::DropReason;
use crate::device::DeviceRegisters;
use crate::ids::{PayloadToken, TxQueueId};
use crate::ownership::QueueOwnership;
use crate::packet::{Fragment, TxPayload};
use crate::ring::shadow::{ShadowEntry, ShadowQueue};
use crate::ring::tx::{TxDescriptor, TxRing, fragment_flags};
use crate::sched::{RateLimit, SchedPolicy};

/// Largest fragment one descriptor can describe.
pub const MAX_DESC_LEN: usize = u16::MAX as usize;

/// Counter snapshot of one TX queue.
#[derive(Debug, Clone, Serialize)]
pub struct TxQueueStats {
    pub id: TxQueueId,
    pub size: usize,
    pub live: usize,
    pub stopped: bool,
    pub ownership: QueueOwnership,
    pub policy: SchedPolicy,
    pub rate: Option<RateLimit>,
    pub packets: u64,
    pub bytes: u64,
    pub descriptors: u64,
    /// Packets refused for lack of descriptors.
    pub no_resource: u64,
    pub invalid: u64,
    pub reclaimed: u64,
    pub stops: u64,
    pub wakes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets: u64,
    bytes: u64,
    descriptors: u64,
    no_resource: u64,
    invalid: u64,
    reclaimed: u64,
    stops: u64,
    wakes: u64,
}

/// Result of reclaiming completed descriptors.
#[derive(Debug, Default)]
pub struct Reclaimed {
    pub descriptors: usize,
    pub pool_buffers: usize,
    pub released: Vec<PayloadToken>,
}

struct Rings {
    ring: TxRing,
    shadow: ShadowQueue,
}

pub struct TxQueue {
    id: TxQueueId,
    size: usize,
    pub(crate) policy: SchedPolicy,
    pub(crate) rate: Option<RateLimit>,
    rings: Option<Rings>,
    stopped: bool,
    counters: Counters,
}

impl TxQueue {
    pub fn new(id: TxQueueId, size: usize) -> Self {
        Self {
            id,
            size,
            policy: SchedPolicy::Fixed,
            rate: None,
            rings: None,
            stopped: false,
            counters: Counters::default(),
        }
    }

    pub fn id(&self) -> TxQueueId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        debug_assert!(self.rings.is_none());
        self.size = size;
    }

    pub fn is_open(&self) -> bool {
        self.rings.is_some()
    }

    /// Descriptors handed to the device and not yet reported sent.
    pub fn live(&self) -> usize {
        self.rings.as_ref().map_or(0, |r| r.ring.live())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Allocate the ring for a starting port.
    pub fn open(&mut self) {
        self.rings = Some(Rings {
            ring: TxRing::new(self.size),
            shadow: ShadowQueue::new(self.size),
        });
        self.stopped = false;
    }

    /// Release everything still in flight and free the ring. Returns the
    /// external payloads to hand back to the stack.
    pub fn close(&mut self) -> Reclaimed {
        let live = self.live();
        let reclaimed = self.reclaim(live);
        self.rings = None;
        self.stopped = false;
        reclaimed
    }

    /// Write one packet's descriptors and hand them to the device.
    ///
    /// On failure nothing reaches the device and the payload is handed back
    /// with the reason.
    pub fn transmit(
        &mut self,
        dev: &mut dyn DeviceRegisters,
        fragments: &[Fragment],
        payload: TxPayload,
        pad: bool,
    ) -> Result<(), (DropReason, TxPayload)> {
        let Some(rings) = self.rings.as_mut() else {
            return Err((DropReason::PortDown, payload));
        };
        let count = fragments.len();

        let batch = match rings.ring.acquire(count) {
            Ok(batch) => batch,
            Err(_) => {
                self.counters.no_resource += 1;
                return Err((DropReason::NoResource, payload));
            }
        };

        for (i, frag) in fragments.iter().enumerate() {
            if frag.len == 0 || frag.len > MAX_DESC_LEN {
                // Undo the shadow writes made so far, newest first, then
                // hand the descriptors back.
                for _ in 0..i {
                    rings.shadow.unpush();
                }
                rings.ring.rollback(batch);
                self.counters.invalid += 1;
                debug!(txq = %self.id, fragment = i, len = frag.len, "Invalid TX fragment");
                return Err((DropReason::InvalidFragment, payload));
            }

            let desc = TxDescriptor {
                addr: frag.addr,
                len: frag.len as u32,
                flags: fragment_flags(i, count, pad),
            };
            let slot = rings.ring.slot(&batch, i);
            rings.ring.write(slot, desc);
            dev.write_tx_descriptor(self.id, slot, &desc);
            trace!(txq = %self.id, %slot, len = frag.len, flags = %desc.flags, "TX descriptor");

            if i + 1 < count {
                rings.shadow.push(ShadowEntry::Empty);
            }
        }

        rings.shadow.push(match payload {
            TxPayload::Pool(buffer) => ShadowEntry::PoolBuffer(buffer),
            TxPayload::External(token) => ShadowEntry::External(token),
        });
        rings.ring.commit(batch);
        dev.pending_count_add(self.id, count);

        self.counters.packets += 1;
        self.counters.bytes += fragments.iter().map(|f| f.len as u64).sum::<u64>();
        self.counters.descriptors += count as u64;
        Ok(())
    }

    /// Release the `n` oldest in-flight descriptors.
    pub fn reclaim(&mut self, n: usize) -> Reclaimed {
        let mut out = Reclaimed::default();
        let Some(rings) = self.rings.as_mut() else {
            return out;
        };
        let live = rings.ring.live();
        if n > live {
            warn!(txq = %self.id, reported = n, live, "Device reported more descriptors sent than live");
        }
        let n = n.min(live);

        for _ in 0..n {
            match rings.shadow.pop() {
                Some(ShadowEntry::PoolBuffer(buffer)) => {
                    drop(buffer);
                    out.pool_buffers += 1;
                }
                Some(ShadowEntry::External(token)) => out.released.push(token),
                Some(ShadowEntry::Empty) | None => {}
            }
        }
        rings.ring.complete(n);
        out.descriptors = n;
        self.counters.reclaimed += n as u64;
        out
    }

    /// Descriptors left before the ring is full, sentinel included.
    pub fn room(&self) -> usize {
        self.size - self.live()
    }

    /// Mark stopped if at most `margin` descriptors remain. Returns true on
    /// the transition.
    pub(crate) fn stop_if_full(&mut self, margin: usize) -> bool {
        if self.stopped || self.room() > margin {
            return false;
        }
        self.stop()
    }

    /// Mark running again once more than `margin` descriptors are free.
    pub(crate) fn wake_if_room(&mut self, margin: usize) -> bool {
        if !self.stopped || self.room() <= margin {
            return false;
        }
        self.stopped = false;
        self.counters.wakes += 1;
        true
    }

    pub(crate) fn stop(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        self.counters.stops += 1;
        true
    }

    pub fn stats(&self, ownership: QueueOwnership) -> TxQueueStats {
        let c = &self.counters;
        TxQueueStats {
            id: self.id,
            size: self.size,
            live: self.live(),
            stopped: self.stopped,
            ownership,
            policy: self.policy,
            rate: self.rate,
            packets: c.packets,
            bytes: c.bytes,
            descriptors: c.descriptors,
            no_resource: c.no_resource,
            invalid: c.invalid,
            reclaimed: c.reclaimed,
            stops: c.stops,
            wakes: c.wakes,
        }
    }
}
