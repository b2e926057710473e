//! Engine error type.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ids::TxQueueId;
use crate::ownership::QueueOwnership;
use crate::ring::rx::RxError;

/// Errors returned by pool, ring, queue and port operations.
///
/// Per-packet failures on the data path never surface here; they are
/// counted and the packet is dropped. These are the errors a caller of a
/// configuration or lifecycle operation has to handle.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Device reported receive error: {0}")]
    HardwareStatus(RxError),

    #[error("Ownership conflict on {queue}: queue is {state}")]
    OwnershipConflict {
        queue: TxQueueId,
        state: QueueOwnership,
    },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
