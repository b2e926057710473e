//! Identifier types shared across the engine.
//!
//! Pools and ports are referenced by small integers handed out by the
//! [`Engine`](crate::engine::Engine); queues are addressed relative to their
//! port. None of these carry ownership, they are plain keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub u16);

impl PoolId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool{}", self.0)
    }
}

/// Identifier of a network port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortId(pub u16);

impl PortId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Whether `pool` is this port's affinity pool (same numeric id).
    pub fn is_affine(&self, pool: PoolId) -> bool {
        self.0 == pool.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.0)
    }
}

/// A TX queue, addressed by TX port group and queue index within the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxQueueId {
    pub txp: u8,
    pub txq: u8,
}

impl TxQueueId {
    pub fn new(txp: u8, txq: u8) -> Self {
        Self { txp, txq }
    }

    /// Flat index used for cause bitmasks and queue vectors.
    pub fn flat(&self, txq_per_txp: usize) -> usize {
        self.txp as usize * txq_per_txp + self.txq as usize
    }

    /// Inverse of [`TxQueueId::flat`].
    pub fn from_flat(index: usize, txq_per_txp: usize) -> Self {
        Self {
            txp: (index / txq_per_txp) as u8,
            txq: (index % txq_per_txp) as u8,
        }
    }
}

impl fmt::Display for TxQueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txp{}/txq{}", self.txp, self.txq)
    }
}

/// Abstract processor identity used to key the per-processor default TX
/// queue table. Not bounded by any compile-time processor count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessorId(pub u32);

impl ProcessorId {
    /// Processor identity of the calling thread.
    ///
    /// Threads are numbered in the order they first submit; the number is
    /// stable for the lifetime of the thread.
    pub fn current() -> Self {
        use std::cell::Cell;
        use std::sync::atomic::{AtomicU32, Ordering};

        static NEXT: AtomicU32 = AtomicU32::new(0);
        thread_local! {
            static ID: Cell<Option<u32>> = const { Cell::new(None) };
        }

        ID.with(|id| match id.get() {
            Some(v) => ProcessorId(v),
            None => {
                let v = NEXT.fetch_add(1, Ordering::Relaxed);
                id.set(Some(v));
                ProcessorId(v)
            }
        })
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Opaque token identifying a payload owned by the network stack.
///
/// Handed back through [`NetStack::release_payload`](crate::hooks::NetStack::release_payload)
/// once the device has finished transmitting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadToken(pub u64);

impl fmt::Display for PayloadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txq_flat_roundtrip() {
        let id = TxQueueId::new(1, 3);
        assert_eq!(id.flat(8), 11);
        assert_eq!(TxQueueId::from_flat(11, 8), id);
    }

    #[test]
    fn test_port_pool_affinity() {
        assert!(PortId(2).is_affine(PoolId(2)));
        assert!(!PortId(2).is_affine(PoolId(0)));
    }

    #[test]
    fn test_processor_id_stable_per_thread() {
        let a = ProcessorId::current();
        let b = ProcessorId::current();
        assert_eq!(a, b);

        let other = std::thread::spawn(ProcessorId::current).join().unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_display() {
        assert_eq!(TxQueueId::new(0, 2).to_string(), "txp0/txq2");
        assert_eq!(PoolId(1).to_string(), "pool1");
        assert_eq!(PayloadToken(7).to_string(), "Payload(7)");
    }
}
