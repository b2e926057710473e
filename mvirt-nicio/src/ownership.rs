//! TX queue ownership arbitration.
//!
//! A TX queue is fed either by software (any number of processors holding a
//! reference) or by hardware forwarding from another port, never both.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ids::{PortId, TxQueueId};

/// Who may enqueue into a TX queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum QueueOwnership {
    #[default]
    Free,
    /// Owned by software; the count is the number of processor references.
    CpuOwned(u32),
    /// Fed by hardware forwarding from the given source port.
    HardwareForwardOwned(PortId),
}

impl QueueOwnership {
    pub fn is_cpu_owned(&self) -> bool {
        matches!(self, QueueOwnership::CpuOwned(_))
    }
}

impl fmt::Display for QueueOwnership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueOwnership::Free => write!(f, "free"),
            QueueOwnership::CpuOwned(n) => write!(f, "cpu-owned ({n})"),
            QueueOwnership::HardwareForwardOwned(src) => write!(f, "hwf-owned by {src}"),
        }
    }
}

/// Ownership state of every TX queue of a port, indexed by flat queue index.
pub struct OwnershipTable {
    states: Vec<QueueOwnership>,
    txq_per_txp: usize,
}

impl OwnershipTable {
    pub fn new(tx_ports: usize, txq_per_txp: usize) -> Self {
        Self {
            states: vec![QueueOwnership::Free; tx_ports * txq_per_txp],
            txq_per_txp,
        }
    }

    fn index(&self, queue: TxQueueId) -> Option<usize> {
        let flat = queue.flat(self.txq_per_txp);
        ((queue.txq as usize) < self.txq_per_txp && flat < self.states.len()).then_some(flat)
    }

    fn entry(&mut self, queue: TxQueueId) -> Result<&mut QueueOwnership> {
        let index = self
            .index(queue)
            .ok_or_else(|| Error::NotFound(queue.to_string()))?;
        Ok(&mut self.states[index])
    }

    pub fn state(&self, queue: TxQueueId) -> QueueOwnership {
        self.index(queue)
            .map(|i| self.states[i])
            .unwrap_or_default()
    }

    /// Add a processor reference.
    pub fn claim_cpu(&mut self, queue: TxQueueId) -> Result<()> {
        let state = self.entry(queue)?;
        *state = match *state {
            QueueOwnership::Free => QueueOwnership::CpuOwned(1),
            QueueOwnership::CpuOwned(n) => QueueOwnership::CpuOwned(n + 1),
            other => return Err(Error::OwnershipConflict { queue, state: other }),
        };
        debug!(txq = %queue, state = %state, "TX queue claimed by cpu");
        Ok(())
    }

    /// Drop a processor reference; the last one frees the queue.
    pub fn release_cpu(&mut self, queue: TxQueueId) -> Result<()> {
        let state = self.entry(queue)?;
        *state = match *state {
            QueueOwnership::CpuOwned(1) => QueueOwnership::Free,
            QueueOwnership::CpuOwned(n) => QueueOwnership::CpuOwned(n - 1),
            other => return Err(Error::OwnershipConflict { queue, state: other }),
        };
        Ok(())
    }

    /// Hand the queue to hardware forwarding from `source`.
    pub fn claim_hwf(&mut self, queue: TxQueueId, source: PortId) -> Result<()> {
        let state = self.entry(queue)?;
        match *state {
            QueueOwnership::Free => *state = QueueOwnership::HardwareForwardOwned(source),
            QueueOwnership::HardwareForwardOwned(src) if src == source => {}
            other => return Err(Error::OwnershipConflict { queue, state: other }),
        }
        debug!(txq = %queue, %source, "TX queue claimed by hardware forwarding");
        Ok(())
    }

    pub fn release_hwf(&mut self, queue: TxQueueId) -> Result<()> {
        let state = self.entry(queue)?;
        match *state {
            QueueOwnership::HardwareForwardOwned(_) => *state = QueueOwnership::Free,
            other => return Err(Error::OwnershipConflict { queue, state: other }),
        }
        Ok(())
    }

    /// Every queue back to Free.
    pub fn reset(&mut self) {
        self.states.fill(QueueOwnership::Free);
    }
}
