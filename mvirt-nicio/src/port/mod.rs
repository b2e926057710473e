//! One NIC port: its RX and TX queues, queue mapping and ownership, and the
//! lifecycle and submission entry points.
//!
//! All ring state lives in [`PortState`] behind a single port mutex. Every
//! ring mutation (TX acquire, reclaim, RX refill) happens under it. Anything
//! destined for the network stack is collected as an [`Event`] while the
//! lock is held and dispatched after it is released, so stack callbacks may
//! re-enter the port. Events that lose a race with [`Port::stop`] are
//! dropped at dispatch, payload releases aside.

pub mod rxq;
pub mod txq;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

pub use rxq::{RxDrain, RxQueue, RxQueueStats};
pub use txq::{MAX_DESC_LEN, Reclaimed, TxQueue, TxQueueStats};

use crate::config::{
    ConfigError, MAX_TX_FRAGS, PortConfig, validate_mtu, validate_ring_size,
};
use crate::device::{Command, DeviceRegisters};
use crate::error::{Error, Result};
use crate::hooks::{
    Classifier, Hook, NetStack, PortHooks, RxIntercept, TxIntercept, TxSpecial,
};
use crate::ids::{PayloadToken, PoolId, PortId, ProcessorId, TxQueueId};
use crate::ownership::{OwnershipTable, QueueOwnership};
use crate::packet::{RxFrame, TxPacket, TxPayload, ipv4_tos};
use crate::pool::{BufferPool, PoolSet, rx_pkt_size};
use crate::retry::RetryHandle;
use crate::sched::{RateLimit, TxQueueParams};

/// Why a submitted packet was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropReason {
    PortDown,
    LinkDown,
    NoQueue,
    QueueNotOwned,
    Classified,
    Intercepted,
    InvalidPacket,
    InvalidFragment,
    NoResource,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::PortDown => "port down",
            DropReason::LinkDown => "link down",
            DropReason::NoQueue => "no TX queue",
            DropReason::QueueNotOwned => "TX queue not cpu-owned",
            DropReason::Classified => "dropped by classifier",
            DropReason::Intercepted => "consumed by TX intercept",
            DropReason::InvalidPacket => "invalid packet",
            DropReason::InvalidFragment => "invalid fragment",
            DropReason::NoResource => "no TX descriptors",
        };
        f.write_str(s)
    }
}

/// Result of [`Port::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Queued,
    Dropped(DropReason),
}

impl Submit {
    pub fn is_queued(&self) -> bool {
        matches!(self, Submit::Queued)
    }
}

/// Something to tell the network stack once the port lock is released.
#[derive(Debug)]
pub(crate) enum Event {
    Frame(RxFrame),
    Special(RxFrame),
    Carrier(bool),
    Stopped(TxQueueId),
    Woken(TxQueueId),
    Release(PayloadToken),
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PortFlags {
    pub started: bool,
    pub link_up: bool,
    pub no_pad: bool,
    pub debug_rx: bool,
    pub debug_tx: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PortCounters {
    pub polls: u64,
    pub poll_idle: u64,
    pub interrupts: u64,
    /// Interrupts taken while the port was stopped.
    pub spurious: u64,
    pub link_events: u64,
    pub tx_dropped: u64,
    pub tx_intercepted: u64,
    pub tx_classified_drop: u64,
    pub rx_special_unhandled: u64,
    pub queue_stops: u64,
    pub queue_wakes: u64,
    /// Descriptors reclaimed on the submit path.
    pub tx_done_inline: u64,
    /// Descriptors reclaimed by poll sessions.
    pub tx_done_poll: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortStats {
    pub id: PortId,
    pub started: bool,
    pub link_up: bool,
    pub mtu: usize,
    pub pool: Option<PoolId>,
    pub counters: PortCounters,
    pub rxqs: Vec<RxQueueStats>,
    pub txqs: Vec<TxQueueStats>,
}

pub(crate) struct PortState {
    pub flags: PortFlags,
    pub mtu: usize,
    pub device: Box<dyn DeviceRegisters>,
    pub rxqs: Vec<RxQueue>,
    pub txqs: Vec<TxQueue>,
    pub tx_ports: usize,
    pub txq_per_txp: usize,
    pub ownership: OwnershipTable,
    default_txq: BTreeMap<ProcessorId, TxQueueId>,
    fallback_txq: Option<TxQueueId>,
    tos_map: Box<[Option<TxQueueId>; 256]>,
    txp_rates: Vec<Option<RateLimit>>,
    pub pool: Option<Arc<BufferPool>>,
    pool_buffers: usize,
    txdone_threshold: usize,
    pub stop_margin: usize,
    pub counters: PortCounters,
}

impl PortState {
    pub fn txq_index(&self, queue: TxQueueId) -> Option<usize> {
        ((queue.txp as usize) < self.tx_ports && (queue.txq as usize) < self.txq_per_txp)
            .then(|| queue.flat(self.txq_per_txp))
    }

    fn check_txq(&self, queue: TxQueueId) -> Result<usize> {
        self.txq_index(queue)
            .ok_or_else(|| ConfigError::UnknownTxQueue(queue).into())
    }

    /// Queues referenced by the default, fallback and ToS mappings, one
    /// entry per reference.
    fn mapped_queues(&self) -> Vec<TxQueueId> {
        self.default_txq
            .values()
            .copied()
            .chain(self.fallback_txq)
            .chain(self.tos_map.iter().flatten().copied())
            .collect()
    }

    fn claim_mapped(&mut self) -> Result<()> {
        let queues = self.mapped_queues();
        for (i, &queue) in queues.iter().enumerate() {
            if let Err(e) = self.ownership.claim_cpu(queue) {
                for &claimed in &queues[..i] {
                    let _ = self.ownership.release_cpu(claimed);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn release_mapped(&mut self) {
        for queue in self.mapped_queues() {
            let _ = self.ownership.release_cpu(queue);
        }
    }

    /// Move one mapping reference from `old` to `new`. Ownership only
    /// changes while started; a stopped port claims on start.
    fn remap(&mut self, old: Option<TxQueueId>, new: Option<TxQueueId>) -> Result<()> {
        if let Some(queue) = new {
            self.check_txq(queue)?;
        }
        if !self.flags.started || old == new {
            return Ok(());
        }
        if let Some(queue) = new {
            self.ownership.claim_cpu(queue)?;
        }
        if let Some(queue) = old
            && let Err(e) = self.ownership.release_cpu(queue)
        {
            warn!(txq = %queue, error = %e, "Failed to release mapped TX queue");
        }
        Ok(())
    }

    /// Pick the TX queue: redirect or classifier hint first, then the ToS
    /// map, then the processor default, then the fallback.
    fn select_txq(
        &self,
        cpu: ProcessorId,
        chosen: Option<TxQueueId>,
        tos: Option<u8>,
        header: &[u8],
    ) -> Option<TxQueueId> {
        chosen
            .or_else(|| {
                tos.or_else(|| ipv4_tos(header))
                    .and_then(|tos| self.tos_map[tos as usize])
            })
            .or_else(|| self.default_txq.get(&cpu).copied())
            .or(self.fallback_txq)
    }

    fn transmit(
        &mut self,
        cpu: ProcessorId,
        packet: TxPacket,
        chosen: Option<TxQueueId>,
        tos: Option<u8>,
        events: &mut Vec<Event>,
    ) -> std::result::Result<(), (DropReason, TxPayload)> {
        if !self.flags.started {
            return Err((DropReason::PortDown, packet.into_parts().1));
        }
        if !self.flags.link_up {
            return Err((DropReason::LinkDown, packet.into_parts().1));
        }
        let frags = packet.fragments().len();
        if frags == 0 || frags > MAX_TX_FRAGS {
            return Err((DropReason::InvalidPacket, packet.into_parts().1));
        }

        let Some(queue) = self.select_txq(cpu, chosen, tos, packet.header()) else {
            return Err((DropReason::NoQueue, packet.into_parts().1));
        };
        let Some(idx) = self.txq_index(queue) else {
            return Err((DropReason::NoQueue, packet.into_parts().1));
        };
        if !self.ownership.state(queue).is_cpu_owned() {
            return Err((DropReason::QueueNotOwned, packet.into_parts().1));
        }

        let len = packet.len();
        let (fragments, payload) = packet.into_parts();
        let pad = !self.flags.no_pad;
        self.txqs[idx].transmit(self.device.as_mut(), &fragments, payload, pad)?;

        if self.flags.debug_tx {
            trace!(txq = %queue, %cpu, len, frags, "TX packet");
        }

        if self.txqs[idx].live() >= self.txdone_threshold {
            let sent = self.device.tx_sent(queue);
            let n = self.reclaim_txq(idx, sent, events);
            self.counters.tx_done_inline += n as u64;
        }
        if self.txqs[idx].stop_if_full(self.stop_margin) {
            self.counters.queue_stops += 1;
            debug!(txq = %queue, live = self.txqs[idx].live(), "TX queue stopped");
            events.push(Event::Stopped(queue));
        }
        Ok(())
    }

    /// Reclaim `n` sent descriptors of a queue and wake it if it has room
    /// again. Returns the descriptors reclaimed.
    pub fn reclaim_txq(&mut self, idx: usize, n: usize, events: &mut Vec<Event>) -> usize {
        let txq = &mut self.txqs[idx];
        let reclaimed = txq.reclaim(n);
        events.extend(reclaimed.released.into_iter().map(Event::Release));

        if self.flags.started && self.flags.link_up && txq.wake_if_room(self.stop_margin) {
            self.counters.queue_wakes += 1;
            debug!(txq = %txq.id(), "TX queue woken");
            events.push(Event::Woken(txq.id()));
        }
        reclaimed.descriptors
    }

    /// Link went down: stop every queue. Link came up: wake every stopped
    /// queue with room.
    pub fn link_changed(&mut self, up: bool, events: &mut Vec<Event>) {
        self.flags.link_up = up;
        self.counters.link_events += 1;
        events.push(Event::Carrier(up));
        for txq in &mut self.txqs {
            let changed = if up {
                txq.wake_if_room(self.stop_margin)
            } else {
                txq.stop()
            };
            if !changed {
                continue;
            }
            if up {
                self.counters.queue_wakes += 1;
                events.push(Event::Woken(txq.id()));
            } else {
                self.counters.queue_stops += 1;
                events.push(Event::Stopped(txq.id()));
            }
        }
    }

    /// Refill RX slots a previous refill had to leave empty. Returns the
    /// slots still unarmed.
    pub fn refill_deferred(&mut self) -> usize {
        if !self.flags.started {
            return 0;
        }
        let Some(pool) = self.pool.clone() else {
            return 0;
        };
        let device = self.device.as_mut();
        let mut remaining = 0;
        for rxq in &mut self.rxqs {
            remaining += rxq.refill_deferred(device, &pool);
        }
        remaining
    }
}

/// A NIC port.
pub struct Port {
    id: PortId,
    pub(crate) state: Mutex<PortState>,
    hooks: RwLock<PortHooks>,
    /// A poll session is pending or running.
    pub(crate) scheduled: AtomicBool,
    /// Bumped by every stop, under the state lock. Events carry the value
    /// they were collected under.
    epoch: AtomicU64,
    waker: Mutex<Option<Sender<()>>>,
    pub(crate) retry: RetryHandle,
    pools: Arc<PoolSet>,
}

impl Port {
    pub fn new(
        id: PortId,
        config: &PortConfig,
        device: Box<dyn DeviceRegisters>,
        pools: Arc<PoolSet>,
        retry: RetryHandle,
    ) -> Result<Self> {
        config.validate()?;

        let rxqs = config
            .rx_queues
            .iter()
            .enumerate()
            .map(|(i, q)| RxQueue::new(i, q.size, q.priority))
            .collect();
        let txqs = (0..config.txq_count())
            .map(|i| TxQueue::new(TxQueueId::from_flat(i, config.txq_per_txp), config.txq_size))
            .collect();

        let mut tos_map = Box::new([None; 256]);
        for entry in &config.tos_map {
            tos_map[entry.tos as usize] = Some(entry.txq);
        }
        let default_txq = config
            .default_txq
            .iter()
            .map(|d| (ProcessorId(d.cpu), d.txq))
            .collect();

        let state = PortState {
            flags: PortFlags {
                no_pad: config.no_pad,
                debug_rx: config.debug_rx,
                debug_tx: config.debug_tx,
                ..Default::default()
            },
            mtu: config.mtu,
            device,
            rxqs,
            txqs,
            tx_ports: config.tx_ports,
            txq_per_txp: config.txq_per_txp,
            ownership: OwnershipTable::new(config.tx_ports, config.txq_per_txp),
            default_txq,
            fallback_txq: config.fallback_txq,
            tos_map,
            txp_rates: vec![None; config.tx_ports],
            pool: None,
            pool_buffers: config.pool_buffers,
            txdone_threshold: config.txdone_threshold,
            stop_margin: config.tx_stop_margin,
            counters: PortCounters::default(),
        };

        debug!(
            port = %id,
            mtu = config.mtu,
            rxqs = config.rx_queues.len(),
            txqs = config.txq_count(),
            "Port created"
        );

        Ok(Self {
            id,
            state: Mutex::new(state),
            hooks: RwLock::new(PortHooks::default()),
            scheduled: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            waker: Mutex::new(None),
            retry,
            pools,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn is_started(&self) -> bool {
        self.lock().flags.started
    }

    pub fn link_up(&self) -> bool {
        self.lock().flags.link_up
    }

    pub fn mtu(&self) -> usize {
        self.lock().mtu
    }

    /// Every TX queue of the port in flat index order.
    pub fn txq_ids(&self) -> Vec<TxQueueId> {
        self.lock().txqs.iter().map(TxQueue::id).collect()
    }

    pub fn rxq_count(&self) -> usize {
        self.lock().rxqs.len()
    }

    // Hooks

    pub(crate) fn hooks(&self) -> PortHooks {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_hooks(&self, hooks: PortHooks) {
        *self.hooks.write().unwrap_or_else(|e| e.into_inner()) = hooks;
    }

    pub fn attach_stack(&self, stack: Arc<dyn NetStack>) {
        self.hooks.write().unwrap_or_else(|e| e.into_inner()).stack = Hook::Custom(stack);
    }

    pub fn set_classifier(&self, classifier: Hook<dyn Classifier>) {
        self.hooks.write().unwrap_or_else(|e| e.into_inner()).classifier = classifier;
    }

    pub fn set_tx_intercept(&self, intercept: Hook<dyn TxIntercept>) {
        self.hooks.write().unwrap_or_else(|e| e.into_inner()).tx_special = intercept;
    }

    pub fn set_rx_intercept(&self, intercept: Hook<dyn RxIntercept>) {
        self.hooks.write().unwrap_or_else(|e| e.into_inner()).rx_special = intercept;
    }

    /// Channel poked when an interrupt schedules a poll session.
    pub fn set_waker(&self, waker: Option<Sender<()>>) {
        *self.waker.lock().unwrap_or_else(|e| e.into_inner()) = waker;
    }

    /// Stop generation; read it under the state lock to tag events.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Hand collected events to the hooks. Events collected before a stop
    /// that has happened since are dropped, except payload releases.
    pub(crate) fn dispatch(&self, hooks: &PortHooks, epoch: u64, events: Vec<Event>) {
        let stack = hooks.stack.get();
        for event in events {
            if !matches!(event, Event::Release(_)) && self.epoch() != epoch {
                trace!(port = %self.id, ?event, "Port stopped since, event dropped");
                continue;
            }
            match event {
                Event::Frame(frame) => match stack {
                    Some(stack) => stack.receive(self.id, frame),
                    None => trace!(port = %self.id, len = frame.len(), "No stack attached, frame dropped"),
                },
                Event::Special(frame) => match (hooks.rx_special.get(), stack) {
                    (Some(hook), _) => hook.receive(self.id, frame),
                    (None, Some(stack)) => stack.receive(self.id, frame),
                    (None, None) => {
                        self.lock().counters.rx_special_unhandled += 1;
                    }
                },
                Event::Carrier(up) => {
                    if let Some(stack) = stack {
                        stack.carrier_changed(self.id, up);
                    }
                }
                Event::Stopped(txq) => {
                    if let Some(stack) = stack {
                        stack.queue_stopped(self.id, txq);
                    }
                }
                Event::Woken(txq) => {
                    if let Some(stack) = stack {
                        stack.queue_woken(self.id, txq);
                    }
                }
                Event::Release(token) => {
                    if let Some(stack) = stack {
                        stack.release_payload(self.id, token);
                    }
                }
            }
        }
    }

    // Lifecycle

    /// Bring the port up: claim mapped TX queues, pick a pool, arm the RX
    /// rings and enable the device. Starting a started port does nothing.
    pub fn start(&self) -> Result<()> {
        let mut events = Vec::new();
        let mut deferred = false;
        let epoch = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.flags.started {
                return Ok(());
            }

            st.claim_mapped()?;
            let size = rx_pkt_size(st.mtu);
            let pool = match self.pools.find_for_size(self.id, size) {
                Ok(pool) => pool,
                Err(e) => {
                    st.release_mapped();
                    return Err(e);
                }
            };
            let added = pool.fill(st.pool_buffers);
            if pool.free_count() < st.pool_buffers {
                warn!(
                    port = %self.id,
                    pool = %pool.id(),
                    added,
                    wanted = st.pool_buffers,
                    "Pool could not be filled"
                );
            }

            let device = st.device.as_mut();
            device.write_command(Command::SetMaxRxSize(size));
            for rxq in &mut st.rxqs {
                device.write_command(Command::SetRxBufSize {
                    rxq: rxq.index(),
                    size: pool.size_class(),
                });
                if !rxq.open(device, &pool) {
                    deferred = true;
                }
            }
            for txq in &mut st.txqs {
                txq.open();
            }
            st.pool = Some(pool);

            device.write_command(Command::PortEnable);
            let link = device.link_is_up();
            st.flags.started = true;
            st.flags.link_up = link;
            device.write_command(Command::UnmaskInterrupts);
            if link {
                events.push(Event::Carrier(true));
            }

            info!(port = %self.id, mtu = st.mtu, rx_size = size, link, "Port started");
            self.epoch()
        };

        if deferred {
            self.retry.arm();
        }
        self.dispatch(&self.hooks(), epoch, events);
        Ok(())
    }

    /// Bring the port down. Every in-flight TX packet is released, every RX
    /// buffer returned, and ownership reverts to free. Nothing is in flight
    /// when this returns.
    pub fn stop(&self) -> Result<()> {
        let mut events = Vec::new();
        let epoch = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if !st.flags.started {
                return Ok(());
            }
            st.flags.started = false;
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;

            let device = st.device.as_mut();
            device.write_command(Command::MaskInterrupts);
            device.write_command(Command::PortDisable);

            for txq in &mut st.txqs {
                let reclaimed = txq.close();
                if reclaimed.descriptors > 0 {
                    debug!(txq = %txq.id(), descriptors = reclaimed.descriptors, "Forced TX reclaim");
                }
                events.extend(reclaimed.released.into_iter().map(Event::Release));
                device.write_command(Command::TxqReset(txq.id()));
            }
            for rxq in &mut st.rxqs {
                device.write_command(Command::RxqReset(rxq.index()));
                rxq.close();
            }
            st.ownership.reset();

            if st.flags.link_up {
                st.flags.link_up = false;
                events.push(Event::Carrier(false));
            }
            self.scheduled.store(false, Ordering::Release);
            info!(port = %self.id, "Port stopped");
            epoch
        };
        self.dispatch(&self.hooks(), epoch, events);
        Ok(())
    }

    /// Change the MTU, restarting a running port. An idle pool whose size
    /// no longer matches is unassigned so the next start finds a fitting one.
    ///
    /// If the port cannot restart with the new MTU, the old one is restored
    /// and the port restarted with it before the error is returned.
    pub fn change_mtu(&self, mtu: usize) -> Result<()> {
        validate_mtu(mtu)?;
        let was_started = self.is_started();
        if was_started {
            self.stop()?;
        }
        let old = {
            let mut st = self.lock();
            if let Some(pool) = st.pool.take()
                && pool.size_class() != rx_pkt_size(mtu)
                && let Err(e) = pool.unassign()
            {
                debug!(port = %self.id, pool = %pool.id(), error = %e, "Pool kept its size");
            }
            info!(port = %self.id, from = st.mtu, to = mtu, "MTU changed");
            std::mem::replace(&mut st.mtu, mtu)
        };
        if !was_started {
            return Ok(());
        }
        if let Err(e) = self.start() {
            warn!(port = %self.id, mtu, error = %e, "Restart failed, restoring MTU {old}");
            self.lock().mtu = old;
            if let Err(again) = self.start() {
                warn!(port = %self.id, mtu = old, error = %again, "Port left stopped");
            }
            return Err(e);
        }
        Ok(())
    }

    // Transmit

    /// Submit a packet on behalf of the calling thread.
    pub fn submit(&self, packet: TxPacket, tos: Option<u8>) -> Submit {
        self.submit_on(ProcessorId::current(), packet, tos)
    }

    /// Submit a packet on behalf of processor `cpu`. A dropped packet's
    /// payload is released right away.
    pub fn submit_on(&self, cpu: ProcessorId, packet: TxPacket, tos: Option<u8>) -> Submit {
        let hooks = self.hooks();

        let mut chosen = None;
        if let Some(intercept) = hooks.tx_special.get() {
            match intercept.check(self.id, &packet) {
                TxSpecial::Pass => {}
                TxSpecial::Redirect(queue) => chosen = Some(queue),
                TxSpecial::Consume => {
                    self.lock().counters.tx_intercepted += 1;
                    return self.drop_packet(&hooks, packet.into_parts().1, DropReason::Intercepted);
                }
            }
        }
        if chosen.is_none()
            && let Some(classifier) = hooks.classifier.get()
        {
            let verdict = classifier.classify(packet.header());
            if verdict.drop {
                self.lock().counters.tx_classified_drop += 1;
                return self.drop_packet(&hooks, packet.into_parts().1, DropReason::Classified);
            }
            chosen = verdict.queue_hint;
        }

        let mut events = Vec::new();
        let (result, epoch) = {
            let mut st = self.lock();
            (st.transmit(cpu, packet, chosen, tos, &mut events), self.epoch())
        };
        self.dispatch(&hooks, epoch, events);

        match result {
            Ok(()) => Submit::Queued,
            Err((reason, payload)) => self.drop_packet(&hooks, payload, reason),
        }
    }

    fn drop_packet(&self, hooks: &PortHooks, payload: TxPayload, reason: DropReason) -> Submit {
        self.lock().counters.tx_dropped += 1;
        trace!(port = %self.id, %reason, "TX packet dropped");
        match payload {
            TxPayload::Pool(buffer) => drop(buffer),
            TxPayload::External(token) => {
                if let Some(stack) = hooks.stack.get() {
                    stack.release_payload(self.id, token);
                }
            }
        }
        Submit::Dropped(reason)
    }

    // Ownership and queue mapping

    pub fn claim_cpu(&self, queue: TxQueueId) -> Result<()> {
        self.lock().ownership.claim_cpu(queue)
    }

    pub fn release_cpu(&self, queue: TxQueueId) -> Result<()> {
        self.lock().ownership.release_cpu(queue)
    }

    /// Hand a TX queue to hardware forwarding from port `source`.
    pub fn claim_hwf(&self, queue: TxQueueId, source: PortId) -> Result<()> {
        self.lock().ownership.claim_hwf(queue, source)
    }

    pub fn release_hwf(&self, queue: TxQueueId) -> Result<()> {
        self.lock().ownership.release_hwf(queue)
    }

    pub fn txq_ownership(&self, queue: TxQueueId) -> Result<QueueOwnership> {
        let st = self.lock();
        st.check_txq(queue)?;
        Ok(st.ownership.state(queue))
    }

    /// Map processor `cpu` to a default TX queue, or remove its mapping.
    pub fn set_default_txq(&self, cpu: ProcessorId, queue: Option<TxQueueId>) -> Result<()> {
        let mut st = self.lock();
        let old = st.default_txq.get(&cpu).copied();
        st.remap(old, queue)?;
        match queue {
            Some(queue) => st.default_txq.insert(cpu, queue),
            None => st.default_txq.remove(&cpu),
        };
        Ok(())
    }

    /// Queue used when no other mapping applies.
    pub fn set_fallback_txq(&self, queue: Option<TxQueueId>) -> Result<()> {
        let mut st = self.lock();
        let old = st.fallback_txq;
        st.remap(old, queue)?;
        st.fallback_txq = queue;
        Ok(())
    }

    pub fn set_tos_txq(&self, tos: u8, queue: Option<TxQueueId>) -> Result<()> {
        let mut st = self.lock();
        let old = st.tos_map[tos as usize];
        st.remap(old, queue)?;
        st.tos_map[tos as usize] = queue;
        Ok(())
    }

    // Queue configuration

    /// Apply TX queue parameters. Everything is validated before anything
    /// is applied; resizing needs a stopped port.
    pub fn set_queue_params(&self, queue: TxQueueId, params: TxQueueParams) -> Result<()> {
        if let Some(policy) = params.policy {
            policy.validate()?;
        }
        if let Some(rate) = params.rate {
            rate.validate()?;
        }

        let mut st = self.lock();
        let idx = st.check_txq(queue)?;
        if let Some(size) = params.size {
            validate_ring_size(size)?;
            if st.stop_margin >= size {
                return Err(ConfigError::InvalidStopMargin {
                    margin: st.stop_margin,
                    size,
                }
                .into());
            }
            if st.flags.started {
                return Err(Error::Busy(format!("{} must be stopped to resize {queue}", self.id)));
            }
        }

        let st = &mut *st;
        let txq = &mut st.txqs[idx];
        if let Some(size) = params.size {
            txq.set_size(size);
        }
        if let Some(policy) = params.policy {
            txq.policy = policy;
            st.device.write_command(Command::TxqSchedule { txq: queue, policy });
        }
        if let Some(limit) = params.rate {
            txq.rate = Some(limit);
            st.device.write_command(Command::TxqRateLimit { txq: queue, limit });
        }
        debug!(port = %self.id, txq = %queue, ?params, "TX queue configured");
        Ok(())
    }

    pub fn set_rxq_size(&self, rxq: usize, size: usize) -> Result<()> {
        validate_ring_size(size)?;
        let mut st = self.lock();
        if rxq >= st.rxqs.len() {
            return Err(ConfigError::UnknownRxQueue(rxq).into());
        }
        if st.flags.started {
            return Err(Error::Busy(format!("{} must be stopped to resize rxq{rxq}", self.id)));
        }
        st.rxqs[rxq].set_size(size);
        Ok(())
    }

    pub fn set_rxq_priority(&self, rxq: usize, priority: u8) -> Result<()> {
        let mut st = self.lock();
        let queue = st
            .rxqs
            .get_mut(rxq)
            .ok_or(ConfigError::UnknownRxQueue(rxq))?;
        queue.set_priority(priority);
        Ok(())
    }

    pub fn set_txp_rate_limit(&self, txp: u8, limit: RateLimit) -> Result<()> {
        limit.validate()?;
        let mut st = self.lock();
        let Some(slot) = st.txp_rates.get_mut(txp as usize) else {
            return Err(ConfigError::UnknownTxPort(txp).into());
        };
        *slot = Some(limit);
        st.device.write_command(Command::TxpRateLimit { txp, limit });
        Ok(())
    }

    pub fn txp_rate_limit(&self, txp: u8) -> Option<RateLimit> {
        self.lock().txp_rates.get(txp as usize).copied().flatten()
    }

    // Interrupts and retry

    /// Device interrupt: mask further interrupts and wake the worker, once
    /// per scheduled session.
    pub fn interrupt(&self) {
        {
            let mut st = self.lock();
            st.counters.interrupts += 1;
            if !st.flags.started {
                st.counters.spurious += 1;
                return;
            }
            st.device.write_command(Command::MaskInterrupts);
        }
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let waker = self.waker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(waker) = waker.as_ref() {
            // Full means a wake-up is already queued.
            let _ = waker.try_send(());
        }
    }

    /// Whether an interrupt scheduled a poll session that has not finished.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Arm deferred RX slots. Returns the slots still unarmed.
    pub fn refill_deferred(&self) -> usize {
        let remaining = self.lock().refill_deferred();
        if remaining > 0 {
            trace!(port = %self.id, remaining, "RX refill still deferred");
        }
        remaining
    }

    pub fn stats(&self) -> PortStats {
        let st = self.lock();
        PortStats {
            id: self.id,
            started: st.flags.started,
            link_up: st.flags.link_up,
            mtu: st.mtu,
            pool: st.pool.as_ref().map(|p| p.id()),
            counters: st.counters.clone(),
            rxqs: st.rxqs.iter().map(RxQueue::stats).collect(),
            txqs: st
                .txqs
                .iter()
                .map(|q| q.stats(st.ownership.state(q.id())))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TosEntry;
    use crate::hooks::Classification;
    use crate::test_util::packets::ipv4_frame;
    use crate::test_util::{RecordingStack, SimDevice};

    const Q0: TxQueueId = TxQueueId { txp: 0, txq: 0 };
    const Q1: TxQueueId = TxQueueId { txp: 0, txq: 1 };
    const CPU: ProcessorId = ProcessorId(0);

    fn port(config: PortConfig) -> (Port, SimDevice, Arc<PoolSet>) {
        let pools = Arc::new(PoolSet::new());
        pools.create(0, 512).unwrap();
        let dev = SimDevice::new(config.rx_queues.len());
        let port = Port::new(
            PortId(0),
            &config,
            Box::new(dev.clone()),
            pools.clone(),
            RetryHandle::detached(),
        )
        .unwrap();
        (port, dev, pools)
    }

    fn two_queues() -> PortConfig {
        PortConfig {
            txq_per_txp: 2,
            txq_size: 64,
            pool_buffers: 64,
            ..Default::default()
        }
    }

    fn packet(pool: &Arc<BufferPool>, tos: u8) -> TxPacket {
        let mut buf = pool.get().unwrap();
        buf.fill_from(&ipv4_frame(tos, 100));
        TxPacket::from_buffer(buf)
    }

    #[test]
    fn test_start_claims_fallback_queue() {
        let (port, dev, _) = port(two_queues());
        assert_eq!(port.txq_ownership(Q0).unwrap(), QueueOwnership::Free);
        port.start().unwrap();
        assert_eq!(port.txq_ownership(Q0).unwrap(), QueueOwnership::CpuOwned(1));
        assert_eq!(port.txq_ownership(Q1).unwrap(), QueueOwnership::Free);
        assert!(dev.commands().contains(&Command::PortEnable));

        port.stop().unwrap();
        assert_eq!(port.txq_ownership(Q0).unwrap(), QueueOwnership::Free);
    }

    #[test]
    fn test_start_fails_on_hwf_owned_queue() {
        let (port, _, pools) = port(two_queues());
        port.claim_hwf(Q0, PortId(1)).unwrap();
        assert!(matches!(port.start(), Err(Error::OwnershipConflict { .. })));
        assert!(!port.is_started());
        assert_eq!(pools.stats()[0].outstanding, 0);
    }

    #[test]
    fn test_tos_map_selects_queue() {
        let (port, dev, _) = port(PortConfig {
            tos_map: vec![TosEntry { tos: 0xb8, txq: Q1 }],
            ..two_queues()
        });
        port.start().unwrap();
        let pool = port.lock().pool.clone().unwrap();

        assert!(port.submit_on(CPU, packet(&pool, 0xb8), None).is_queued());
        assert!(port.submit_on(CPU, packet(&pool, 0x00), None).is_queued());
        assert_eq!(dev.tx_queued(Q1), 1);
        assert_eq!(dev.tx_queued(Q0), 1);

        // An explicit ToS wins over the parsed one.
        assert!(port.submit_on(CPU, packet(&pool, 0x00), Some(0xb8)).is_queued());
        assert_eq!(dev.tx_queued(Q1), 2);
    }

    #[test]
    fn test_default_txq_per_processor() {
        let (port, dev, _) = port(two_queues());
        port.start().unwrap();
        port.set_default_txq(ProcessorId(7), Some(Q1)).unwrap();
        assert_eq!(port.txq_ownership(Q1).unwrap(), QueueOwnership::CpuOwned(1));

        let pool = port.lock().pool.clone().unwrap();
        port.submit_on(ProcessorId(7), packet(&pool, 0), None);
        port.submit_on(ProcessorId(3), packet(&pool, 0), None);
        assert_eq!(dev.tx_queued(Q1), 1);
        assert_eq!(dev.tx_queued(Q0), 1);

        port.set_default_txq(ProcessorId(7), None).unwrap();
        assert_eq!(port.txq_ownership(Q1).unwrap(), QueueOwnership::Free);
    }

    #[test]
    fn test_submit_to_hwf_queue_dropped() {
        let (port, _, _) = port(PortConfig {
            fallback_txq: None,
            ..two_queues()
        });
        port.start().unwrap();
        port.claim_hwf(Q1, PortId(2)).unwrap();
        port.set_tos_txq(0x10, Some(Q0)).unwrap();
        assert!(port.set_tos_txq(0x20, Some(Q1)).is_err());

        let pool = port.lock().pool.clone().unwrap();
        assert_eq!(
            port.submit_on(CPU, packet(&pool, 0x30), None),
            Submit::Dropped(DropReason::NoQueue)
        );
        assert!(port.submit_on(CPU, packet(&pool, 0x10), None).is_queued());
    }

    struct HintQ1;

    impl Classifier for HintQ1 {
        fn classify(&self, _header: &[u8]) -> Classification {
            Classification {
                queue_hint: Some(Q1),
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_classifier_hint_needs_ownership() {
        let (port, dev, _) = port(two_queues());
        port.set_classifier(Hook::Custom(Arc::new(HintQ1)));
        port.start().unwrap();
        let pool = port.lock().pool.clone().unwrap();

        assert_eq!(
            port.submit_on(CPU, packet(&pool, 0), None),
            Submit::Dropped(DropReason::QueueNotOwned)
        );
        port.claim_cpu(Q1).unwrap();
        assert!(port.submit_on(CPU, packet(&pool, 0), None).is_queued());
        assert_eq!(dev.tx_queued(Q1), 1);
    }

    #[test]
    fn test_submit_on_stopped_port() {
        let (port, _, pools) = port(two_queues());
        let pool = pools.find_for_size(PortId(0), 1536).unwrap();
        assert_eq!(
            port.submit_on(CPU, packet(&pool, 0), None),
            Submit::Dropped(DropReason::PortDown)
        );
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_resize_requires_stopped_port() {
        let (port, _, _) = port(two_queues());
        port.start().unwrap();
        let params = TxQueueParams {
            size: Some(128),
            ..Default::default()
        };
        assert!(matches!(
            port.set_queue_params(Q0, params.clone()),
            Err(Error::Busy(_))
        ));
        assert!(matches!(port.set_rxq_size(0, 64), Err(Error::Busy(_))));

        port.stop().unwrap();
        port.set_queue_params(Q0, params).unwrap();
        assert_eq!(port.stats().txqs[0].size, 128);
    }

    #[test]
    fn test_invalid_params_not_applied() {
        use crate::sched::SchedPolicy;

        let (port, dev, _) = port(two_queues());
        let params = TxQueueParams {
            policy: Some(SchedPolicy::Weighted(4)),
            rate: Some(RateLimit {
                rate_kbps: 0,
                burst_bytes: 1500,
            }),
            ..Default::default()
        };
        assert!(port.set_queue_params(Q0, params).is_err());
        assert_eq!(port.stats().txqs[0].policy, SchedPolicy::Fixed);
        assert!(dev.commands().is_empty());

        assert!(matches!(
            port.set_queue_params(TxQueueId::new(1, 0), TxQueueParams::default()),
            Err(Error::Config(ConfigError::UnknownTxQueue(_)))
        ));
    }

    #[test]
    fn test_txp_rate_limit() {
        let (port, dev, _) = port(two_queues());
        let limit = RateLimit::new(10_000, 3000).unwrap();
        port.set_txp_rate_limit(0, limit).unwrap();
        assert_eq!(port.txp_rate_limit(0), Some(limit));
        assert!(dev.commands().contains(&Command::TxpRateLimit { txp: 0, limit }));
        assert!(matches!(
            port.set_txp_rate_limit(1, limit),
            Err(Error::Config(ConfigError::UnknownTxPort(1)))
        ));
    }

    #[test]
    fn test_interrupt_wakes_once() {
        let (port, dev, _) = port(two_queues());
        let (tx, rx) = crossbeam_channel::bounded(1);
        port.set_waker(Some(tx));

        port.interrupt();
        assert_eq!(port.stats().counters.spurious, 1);
        assert!(rx.try_recv().is_err());

        port.start().unwrap();
        port.interrupt();
        port.interrupt();
        assert!(dev.interrupts_masked());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(port.is_scheduled());
    }

    #[test]
    fn test_events_from_before_stop_are_dropped() {
        let (port, _, _) = port(two_queues());
        let stack = Arc::new(RecordingStack::new());
        port.attach_stack(stack.clone());
        port.start().unwrap();
        let pool = port.lock().pool.clone().unwrap();

        // Collected by a session that finished just before the stop
        let epoch = port.epoch();
        let frame = RxFrame::new(pool.get().unwrap(), 0, false);
        let events = vec![
            Event::Frame(frame),
            Event::Woken(Q0),
            Event::Release(PayloadToken(5)),
        ];
        port.stop().unwrap();
        let outstanding = pool.outstanding();

        port.dispatch(&port.hooks(), epoch, events);
        assert_eq!(stack.frame_count(), 0);
        assert!(stack.woken().is_empty());
        assert_eq!(stack.released(), vec![PayloadToken(5)]);
        assert_eq!(pool.outstanding(), outstanding - 1);
        assert_eq!(stack.carrier(), vec![true, false]);
    }

    #[test]
    fn test_stack_sees_carrier() {
        let (port, _, _) = port(two_queues());
        let stack = Arc::new(RecordingStack::new());
        port.attach_stack(stack.clone());
        port.start().unwrap();
        port.stop().unwrap();
        assert_eq!(stack.carrier(), vec![true, false]);
    }
}
