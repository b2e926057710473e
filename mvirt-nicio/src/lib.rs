pub mod arena;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod ids;
pub mod ownership;
pub mod packet;
pub mod poll;
pub mod pool;
pub mod port;
pub mod retry;
pub mod ring;
pub mod sched;
pub mod test_util;
pub mod worker;

pub use engine::{Engine, EngineStats};
pub use error::{Error, Result};
