//! Test utilities
//!
//! A software device implementing the register layer, a recording network
//! stack, and frame builders. Used by unit tests, the integration tests and
//! the `simulate` command.

pub mod device;
pub mod packets;
pub mod stack;

pub use device::SimDevice;
pub use stack::{ReceivedFrame, RecordingStack};
