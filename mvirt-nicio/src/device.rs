//! Device register interface.
//!
//! The engine never touches hardware directly. Everything it needs from the
//! NIC goes through [`DeviceRegisters`]: cause readout, descriptor arming,
//! occupancy counters and control commands. Implementations must not block.

use std::fmt;

use crate::ids::TxQueueId;
use crate::ring::SlotIndex;
use crate::ring::tx::TxDescriptor;
use crate::sched::{RateLimit, SchedPolicy};

/// Interrupt cause snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cause {
    /// Link state changed (misc cause).
    pub link_change: bool,
    /// TX-done bits, one per flat TX queue index.
    pub tx_done: u64,
    /// RX bits, one per RX queue with filled descriptors.
    pub rx: u64,
}

impl Cause {
    pub fn is_empty(&self) -> bool {
        !self.link_change && self.tx_done == 0 && self.rx == 0
    }
}

/// Status the device wrote into a filled RX descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxDescStatus {
    pub status: u32,
    /// Bytes written, CRC included.
    pub data_size: u16,
}

/// Control operations executed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    MaskInterrupts,
    UnmaskInterrupts,
    ClearMiscCause,
    PortEnable,
    PortDisable,
    /// Largest frame the port accepts.
    SetMaxRxSize(usize),
    /// Buffer size of an RX queue.
    SetRxBufSize { rxq: usize, size: usize },
    RxqReset(usize),
    TxqReset(TxQueueId),
    TxqSchedule { txq: TxQueueId, policy: SchedPolicy },
    TxqRateLimit { txq: TxQueueId, limit: RateLimit },
    TxpRateLimit { txp: u8, limit: RateLimit },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::MaskInterrupts => write!(f, "mask-interrupts"),
            Command::UnmaskInterrupts => write!(f, "unmask-interrupts"),
            Command::ClearMiscCause => write!(f, "clear-misc-cause"),
            Command::PortEnable => write!(f, "port-enable"),
            Command::PortDisable => write!(f, "port-disable"),
            Command::SetMaxRxSize(size) => write!(f, "max-rx-size {size}"),
            Command::SetRxBufSize { rxq, size } => write!(f, "rxq{rxq} buf-size {size}"),
            Command::RxqReset(rxq) => write!(f, "rxq{rxq} reset"),
            Command::TxqReset(txq) => write!(f, "{txq} reset"),
            Command::TxqSchedule { txq, policy } => write!(f, "{txq} schedule {policy}"),
            Command::TxqRateLimit { txq, limit } => write!(f, "{txq} rate {limit}"),
            Command::TxpRateLimit { txp, limit } => write!(f, "txp{txp} rate {limit}"),
        }
    }
}

/// Register-level access to one port of the NIC.
pub trait DeviceRegisters: Send {
    /// Read and clear the interrupt cause. RX bits reflect occupancy and are
    /// not cleared by reading.
    fn read_cause(&mut self) -> Cause;

    fn write_command(&mut self, cmd: Command);

    fn link_is_up(&mut self) -> bool;

    /// Point RX descriptor `slot` of `rxq` at a buffer. Not visible to the
    /// device until published through [`DeviceRegisters::rx_update`].
    fn arm_descriptor(&mut self, rxq: usize, slot: SlotIndex, addr: u64, len: usize);

    /// Number of filled RX descriptors waiting for software.
    fn rx_busy(&mut self, rxq: usize) -> usize;

    /// Status of a filled RX descriptor.
    fn rx_status(&mut self, rxq: usize, slot: SlotIndex) -> RxDescStatus;

    /// Publish a batch: `processed` descriptors were taken by software and
    /// `refilled` descriptors were armed.
    fn rx_update(&mut self, rxq: usize, processed: usize, refilled: usize);

    fn write_tx_descriptor(&mut self, txq: TxQueueId, slot: SlotIndex, desc: &TxDescriptor);

    /// Hand `n` newly written TX descriptors to the device.
    fn pending_count_add(&mut self, txq: TxQueueId, n: usize);

    /// Read and clear the number of TX descriptors sent since the last read.
    fn tx_sent(&mut self, txq: TxQueueId) -> usize;
}
