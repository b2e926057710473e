//! Software model of the NIC register layer.
//!
//! Models just enough of the device to drive the engine: RX descriptors
//! move armed -> filled -> processed in ring order, TX descriptors are
//! queued when published and complete when the test says so (or
//! immediately with auto-complete). Clones share the same device, so a test
//! keeps one handle while the port owns another.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{Cause, Command, DeviceRegisters, RxDescStatus};
use crate::ids::TxQueueId;
use crate::ring::SlotIndex;
use crate::ring::rx::{RX_CRC_SIZE, RX_ERR_LEN, RX_ES, RX_F_DESC, RX_L_DESC};
use crate::ring::tx::TxDescriptor;

#[derive(Debug, Clone, Copy)]
struct RxDesc {
    slot: SlotIndex,
    addr: u64,
    len: usize,
}

#[derive(Debug, Default)]
struct SimRxq {
    /// Armed by software, not yet published.
    staged: VecDeque<RxDesc>,
    armed: VecDeque<RxDesc>,
    filled: VecDeque<(RxDesc, RxDescStatus)>,
}

#[derive(Debug, Default)]
struct SimTxq {
    /// Written by software, not yet published.
    staged: Vec<(SlotIndex, TxDescriptor)>,
    queued: VecDeque<TxDescriptor>,
    written: Vec<TxDescriptor>,
    transmitted: Vec<TxDescriptor>,
    sent: usize,
}

#[derive(Debug)]
struct SimState {
    rxqs: Vec<SimRxq>,
    txqs: HashMap<TxQueueId, SimTxq>,
    link_up: bool,
    link_change: bool,
    tx_done: u64,
    masked: bool,
    enabled: bool,
    auto_complete: bool,
    commands: Vec<Command>,
}

impl SimState {
    fn rxq(&mut self, rxq: usize) -> &mut SimRxq {
        if rxq >= self.rxqs.len() {
            self.rxqs.resize_with(rxq + 1, SimRxq::default);
        }
        &mut self.rxqs[rxq]
    }

    fn complete(&mut self, txq: TxQueueId, n: usize) -> usize {
        let q = self.txqs.entry(txq).or_default();
        let n = n.min(q.queued.len());
        q.transmitted.extend(q.queued.drain(..n));
        q.sent += n;
        if n > 0 {
            self.tx_done |= tx_done_bit(txq);
        }
        n
    }
}

/// TX-done cause bit of a queue, flat index with eight queues per TX port.
fn tx_done_bit(txq: TxQueueId) -> u64 {
    1u64 << (txq.flat(8) % 64)
}

/// Simulated NIC port.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// A device with `rx_queues` RX queues and the link up.
    pub fn new(rx_queues: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                rxqs: (0..rx_queues).map(|_| SimRxq::default()).collect(),
                txqs: HashMap::new(),
                link_up: true,
                link_change: false,
                tx_done: 0,
                masked: true,
                enabled: false,
                auto_complete: false,
                commands: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Complete every published TX descriptor right away.
    pub fn set_auto_complete(&self, on: bool) {
        self.lock().auto_complete = on;
    }

    pub fn set_link(&self, up: bool) {
        let mut st = self.lock();
        if st.link_up != up {
            st.link_up = up;
            st.link_change = true;
        }
    }

    /// Receive a frame into the next armed descriptor. Returns false if
    /// nothing is armed.
    pub fn inject_rx(&self, rxq: usize, frame: &[u8]) -> bool {
        self.inject_rx_with(rxq, frame, 0)
    }

    /// Like [`SimDevice::inject_rx`] with extra status bits.
    pub fn inject_rx_with(&self, rxq: usize, frame: &[u8], extra_status: u32) -> bool {
        let mut st = self.lock();
        let q = st.rxq(rxq);
        let Some(desc) = q.armed.pop_front() else {
            return false;
        };

        let size = frame.len() + RX_CRC_SIZE;
        let status = if size > desc.len {
            RxDescStatus {
                status: RX_F_DESC | RX_L_DESC | RX_ES | RX_ERR_LEN,
                data_size: 0,
            }
        } else {
            // SAFETY: the engine armed `addr` with a buffer of at least
            // `len` bytes and keeps it until the descriptor is processed.
            unsafe {
                let dst = desc.addr as *mut u8;
                std::ptr::copy_nonoverlapping(frame.as_ptr(), dst, frame.len());
                std::ptr::write_bytes(dst.add(frame.len()), 0xcc, RX_CRC_SIZE);
            }
            RxDescStatus {
                status: RX_F_DESC | RX_L_DESC | extra_status,
                data_size: size as u16,
            }
        };
        q.filled.push_back((desc, status));
        true
    }

    /// Fill the next armed descriptor with a raw status and no data.
    pub fn inject_rx_status(&self, rxq: usize, status: u32, data_size: u16) -> bool {
        let mut st = self.lock();
        let q = st.rxq(rxq);
        let Some(desc) = q.armed.pop_front() else {
            return false;
        };
        q.filled.push_back((desc, RxDescStatus { status, data_size }));
        true
    }

    /// Buffer address of the oldest filled descriptor.
    pub fn filled_addr(&self, rxq: usize) -> Option<u64> {
        self.lock().rxq(rxq).filled.front().map(|(d, _)| d.addr)
    }

    /// Descriptors armed and published to the device.
    pub fn armed(&self, rxq: usize) -> usize {
        self.lock().rxq(rxq).armed.len()
    }

    pub fn armed_addrs(&self, rxq: usize) -> Vec<u64> {
        self.lock().rxq(rxq).armed.iter().map(|d| d.addr).collect()
    }

    /// Filled descriptors software has not processed yet.
    pub fn rx_pending(&self, rxq: usize) -> usize {
        self.lock().rxq(rxq).filled.len()
    }

    /// Transmit up to `n` queued descriptors. Returns how many completed.
    pub fn complete_tx(&self, txq: TxQueueId, n: usize) -> usize {
        self.lock().complete(txq, n)
    }

    /// Published descriptors not yet transmitted.
    pub fn tx_queued(&self, txq: TxQueueId) -> usize {
        self.lock().txqs.get(&txq).map_or(0, |q| q.queued.len())
    }

    /// Every descriptor ever published on `txq`.
    pub fn written(&self, txq: TxQueueId) -> Vec<TxDescriptor> {
        self.lock()
            .txqs
            .get(&txq)
            .map(|q| q.written.clone())
            .unwrap_or_default()
    }

    pub fn transmitted(&self, txq: TxQueueId) -> Vec<TxDescriptor> {
        self.lock()
            .txqs
            .get(&txq)
            .map(|q| q.transmitted.clone())
            .unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    pub fn interrupts_masked(&self) -> bool {
        self.lock().masked
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }
}

impl DeviceRegisters for SimDevice {
    fn read_cause(&mut self) -> Cause {
        let mut st = self.lock();
        let rx = st
            .rxqs
            .iter()
            .enumerate()
            .take(64)
            .filter(|(_, q)| !q.filled.is_empty())
            .fold(0u64, |bits, (i, _)| bits | 1 << i);
        Cause {
            link_change: std::mem::take(&mut st.link_change),
            tx_done: std::mem::take(&mut st.tx_done),
            rx,
        }
    }

    fn write_command(&mut self, cmd: Command) {
        let mut st = self.lock();
        match &cmd {
            Command::MaskInterrupts => st.masked = true,
            Command::UnmaskInterrupts => st.masked = false,
            Command::PortEnable => st.enabled = true,
            Command::PortDisable => st.enabled = false,
            Command::RxqReset(rxq) => *st.rxq(*rxq) = SimRxq::default(),
            Command::TxqReset(txq) => {
                if let Some(q) = st.txqs.get_mut(txq) {
                    q.staged.clear();
                    q.queued.clear();
                    q.sent = 0;
                }
            }
            _ => {}
        }
        st.commands.push(cmd);
    }

    fn link_is_up(&mut self) -> bool {
        self.lock().link_up
    }

    fn arm_descriptor(&mut self, rxq: usize, slot: SlotIndex, addr: u64, len: usize) {
        self.lock()
            .rxq(rxq)
            .staged
            .push_back(RxDesc { slot, addr, len });
    }

    fn rx_busy(&mut self, rxq: usize) -> usize {
        self.lock().rxq(rxq).filled.len()
    }

    fn rx_status(&mut self, rxq: usize, slot: SlotIndex) -> RxDescStatus {
        self.lock()
            .rxq(rxq)
            .filled
            .iter()
            .find(|(d, _)| d.slot == slot)
            .map(|(_, status)| *status)
            .unwrap_or_default()
    }

    fn rx_update(&mut self, rxq: usize, processed: usize, refilled: usize) {
        let mut st = self.lock();
        let q = st.rxq(rxq);
        let processed = processed.min(q.filled.len());
        q.filled.drain(..processed);
        let refilled = refilled.min(q.staged.len());
        let published: Vec<RxDesc> = q.staged.drain(..refilled).collect();
        q.armed.extend(published);
    }

    fn write_tx_descriptor(&mut self, txq: TxQueueId, slot: SlotIndex, desc: &TxDescriptor) {
        let mut st = self.lock();
        let q = st.txqs.entry(txq).or_default();
        q.staged.retain(|(s, _)| *s != slot);
        q.staged.push((slot, *desc));
    }

    fn pending_count_add(&mut self, txq: TxQueueId, n: usize) {
        let mut st = self.lock();
        let q = st.txqs.entry(txq).or_default();
        // Older staged writes were rolled back and never published.
        let start = q.staged.len().saturating_sub(n);
        let published: Vec<TxDescriptor> = q.staged.drain(..).skip(start).map(|(_, d)| d).collect();
        q.written.extend_from_slice(&published);
        q.queued.extend(published);
        if st.auto_complete {
            st.complete(txq, n);
        }
    }

    fn tx_sent(&mut self, txq: TxQueueId) -> usize {
        self.lock()
            .txqs
            .get_mut(&txq)
            .map_or(0, |q| std::mem::take(&mut q.sent))
    }
}
