//! Engine configuration.
//!
//! Loaded from JSON. Every field has a default so a config file only needs
//! to name what differs. [`EngineConfig::validate`] rejects anything the
//! engine cannot honor before a single pool or port is created.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::TxQueueId;

/// Smallest MTU a port accepts.
pub const MIN_MTU: usize = 68;

/// Largest MTU a port accepts (jumbo frames).
pub const MAX_MTU: usize = 9676;

pub const DEFAULT_MTU: usize = 1500;

/// Ring sizes accepted for RX and TX queues.
pub const MIN_RING_SIZE: usize = 2;
pub const MAX_RING_SIZE: usize = 16384;

/// RX and TX cause bitmasks are 64 bits wide.
pub const MAX_RX_QUEUES: usize = 32;
pub const MAX_TX_QUEUES: usize = 64;

/// Worst-case descriptor count of a single packet.
pub const MAX_TX_FRAGS: usize = 18;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MTU {0} out of range ({min}..={max})", min = MIN_MTU, max = MAX_MTU)]
    InvalidMtu(usize),

    #[error("Ring size {0} out of range ({min}..={max})", min = MIN_RING_SIZE, max = MAX_RING_SIZE)]
    InvalidRingSize(usize),

    #[error("Port needs between 1 and {max} RX queues, got {0}", max = MAX_RX_QUEUES)]
    InvalidRxQueueCount(usize),

    #[error("Invalid TX layout: {tx_ports} TX ports x {txq_per_txp} queues (max {max})", max = MAX_TX_QUEUES)]
    InvalidTxLayout { tx_ports: usize, txq_per_txp: usize },

    #[error("Unknown TX queue {0}")]
    UnknownTxQueue(TxQueueId),

    #[error("Unknown RX queue {0}")]
    UnknownRxQueue(usize),

    #[error("Unknown TX port {0}")]
    UnknownTxPort(u8),

    #[error("Weight 0 is not allowed, use fixed priority instead")]
    ZeroWeight,

    #[error("Weight {0} out of range (1..=255)")]
    WeightOutOfRange(u16),

    #[error("Rate limit must be positive")]
    InvalidRate,

    #[error("Burst size must be positive")]
    InvalidBurst,

    #[error("Pool capacity {0} out of range (1..={max})", max = u32::MAX)]
    InvalidPoolCapacity(usize),

    #[error("Buffer limit {limit} exceeds pool capacity {capacity}")]
    LimitAboveCapacity { limit: usize, capacity: usize },

    #[error("Poll budget must be positive")]
    InvalidBudget,

    #[error("TX stop margin {margin} must be smaller than queue size {size}")]
    InvalidStopMargin { margin: usize, size: usize },

    #[error("TX done threshold must be positive")]
    InvalidThreshold,

    #[error("Engine has ports but no buffer pools")]
    NoPools,

    #[error("Failed to read config: {0}")]
    Read(#[from] io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pools: Vec<PoolConfig>,
    pub ports: Vec<PortConfig>,
    /// Interval of the coalesced refill retry timer.
    pub retry_interval_ms: u64,
    pub poll: PollConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pools: vec![PoolConfig::default()],
            ports: vec![PortConfig::default()],
            retry_interval_ms: 10,
            poll: PollConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ports.is_empty() && self.pools.is_empty() {
            return Err(ConfigError::NoPools);
        }
        for pool in &self.pools {
            pool.validate()?;
        }
        for port in &self.ports {
            port.validate()?;
        }
        if self.poll.budget == 0 {
            return Err(ConfigError::InvalidBudget);
        }
        Ok(())
    }
}

/// Budget and fallback timing for the per-port poll workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Maximum RX descriptors processed per poll session.
    pub budget: usize,
    /// Period of the fallback session that runs without an interrupt.
    pub fallback_interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            budget: 64,
            fallback_interval_ms: 10,
        }
    }
}

/// One buffer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffer size in bytes; 0 leaves the pool unassigned until a port
    /// claims it for its MTU.
    pub size_class: usize,
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_class: 0,
            capacity: 2048,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 || self.capacity > u32::MAX as usize {
            return Err(ConfigError::InvalidPoolCapacity(self.capacity));
        }
        Ok(())
    }
}

/// One RX queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RxQueueConfig {
    pub size: usize,
    /// Service priority, higher first. Defaults to the queue index.
    pub priority: Option<u8>,
}

impl Default for RxQueueConfig {
    fn default() -> Self {
        Self {
            size: 128,
            priority: None,
        }
    }
}

/// Default TX queue of one processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultTxq {
    pub cpu: u32,
    pub txq: TxQueueId,
}

/// ToS value routed to a TX queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TosEntry {
    pub tos: u8,
    pub txq: TxQueueId,
}

/// One network port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub mtu: usize,
    pub rx_queues: Vec<RxQueueConfig>,
    /// Number of TX port groups.
    pub tx_ports: usize,
    pub txq_per_txp: usize,
    pub txq_size: usize,
    /// Buffers pre-created in the port's pool on start.
    pub pool_buffers: usize,
    /// Reclaim inline on submit once this many descriptors are live.
    pub txdone_threshold: usize,
    /// Stop the producer when this few descriptors remain free.
    pub tx_stop_margin: usize,
    /// Explicit per-processor default TX queues.
    pub default_txq: Vec<DefaultTxq>,
    /// Default TX queue of processors without an explicit entry.
    pub fallback_txq: Option<TxQueueId>,
    pub tos_map: Vec<TosEntry>,
    /// Do not pad short frames on transmit.
    pub no_pad: bool,
    pub debug_rx: bool,
    pub debug_tx: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            rx_queues: vec![RxQueueConfig::default()],
            tx_ports: 1,
            txq_per_txp: 1,
            txq_size: 256,
            pool_buffers: 256,
            txdone_threshold: 16,
            tx_stop_margin: MAX_TX_FRAGS,
            default_txq: Vec::new(),
            fallback_txq: Some(TxQueueId::new(0, 0)),
            tos_map: Vec::new(),
            no_pad: false,
            debug_rx: false,
            debug_tx: false,
        }
    }
}

impl PortConfig {
    pub fn txq_count(&self) -> usize {
        self.tx_ports * self.txq_per_txp
    }

    pub fn has_txq(&self, id: TxQueueId) -> bool {
        (id.txp as usize) < self.tx_ports && (id.txq as usize) < self.txq_per_txp
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_mtu(self.mtu)?;

        if self.rx_queues.is_empty() || self.rx_queues.len() > MAX_RX_QUEUES {
            return Err(ConfigError::InvalidRxQueueCount(self.rx_queues.len()));
        }
        for rxq in &self.rx_queues {
            validate_ring_size(rxq.size)?;
        }

        if self.tx_ports == 0
            || self.txq_per_txp == 0
            || self.tx_ports > u8::MAX as usize
            || self.txq_per_txp > u8::MAX as usize
            || self.txq_count() > MAX_TX_QUEUES
        {
            return Err(ConfigError::InvalidTxLayout {
                tx_ports: self.tx_ports,
                txq_per_txp: self.txq_per_txp,
            });
        }
        validate_ring_size(self.txq_size)?;

        if self.tx_stop_margin >= self.txq_size {
            return Err(ConfigError::InvalidStopMargin {
                margin: self.tx_stop_margin,
                size: self.txq_size,
            });
        }
        if self.txdone_threshold == 0 {
            return Err(ConfigError::InvalidThreshold);
        }

        let mut seen = HashSet::new();
        let referenced = self
            .default_txq
            .iter()
            .map(|d| d.txq)
            .chain(self.fallback_txq)
            .chain(self.tos_map.iter().map(|t| t.txq));
        for txq in referenced {
            if seen.insert(txq) && !self.has_txq(txq) {
                return Err(ConfigError::UnknownTxQueue(txq));
            }
        }
        Ok(())
    }
}

pub fn validate_mtu(mtu: usize) -> Result<(), ConfigError> {
    if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
        return Err(ConfigError::InvalidMtu(mtu));
    }
    Ok(())
}

pub fn validate_ring_size(size: usize) -> Result<(), ConfigError> {
    if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&size) {
        return Err(ConfigError::InvalidRingSize(size));
    }
    Ok(())
}
