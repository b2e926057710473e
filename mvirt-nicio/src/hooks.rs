//! Collaborators plugged into a port: the network stack that consumes
//! frames, the classifier, and the special-processing intercepts.
//!
//! Hooks are resolved when the port is configured; the data path only
//! matches on [`Hook`] and never looks anything up.

use std::sync::Arc;

use crate::ids::{PayloadToken, PortId, TxQueueId};
use crate::packet::{RxFrame, TxPacket};

/// An optional handler.
pub enum Hook<T: ?Sized> {
    None,
    Custom(Arc<T>),
}

impl<T: ?Sized> Hook<T> {
    pub fn get(&self) -> Option<&Arc<T>> {
        match self {
            Hook::None => None,
            Hook::Custom(handler) => Some(handler),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Hook::None)
    }
}

impl<T: ?Sized> Clone for Hook<T> {
    fn clone(&self) -> Self {
        match self {
            Hook::None => Hook::None,
            Hook::Custom(handler) => Hook::Custom(Arc::clone(handler)),
        }
    }
}

impl<T: ?Sized> Default for Hook<T> {
    fn default() -> Self {
        Hook::None
    }
}

/// The network stack above the engine.
///
/// Callbacks run on the thread driving the port, never under the port lock,
/// so a stack may submit packets from inside [`NetStack::receive`].
pub trait NetStack: Send + Sync {
    fn receive(&self, port: PortId, frame: RxFrame);

    fn carrier_changed(&self, _port: PortId, _up: bool) {}

    /// Stop submitting to `txq` until it is woken.
    fn queue_stopped(&self, _port: PortId, _txq: TxQueueId) {}

    fn queue_woken(&self, _port: PortId, _txq: TxQueueId) {}

    /// The device is done with an externally owned payload.
    fn release_payload(&self, _port: PortId, _token: PayloadToken) {}
}

/// Classifier verdict for an outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub queue_hint: Option<TxQueueId>,
    pub flow_id: Option<u32>,
    pub drop: bool,
}

/// Packet classifier, treated as a black box.
pub trait Classifier: Send + Sync {
    fn classify(&self, header: &[u8]) -> Classification;
}

/// Decision of the TX special intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSpecial {
    /// Normal queue selection.
    Pass,
    /// Send on this queue regardless of classification.
    Redirect(TxQueueId),
    /// The intercept took care of the packet; release it.
    Consume,
}

pub trait TxIntercept: Send + Sync {
    fn check(&self, port: PortId, packet: &TxPacket) -> TxSpecial;
}

/// Receives frames the device marked special instead of the stack.
pub trait RxIntercept: Send + Sync {
    fn receive(&self, port: PortId, frame: RxFrame);
}

/// All hooks of one port.
#[derive(Clone, Default)]
pub struct PortHooks {
    pub stack: Hook<dyn NetStack>,
    pub classifier: Hook<dyn Classifier>,
    pub tx_special: Hook<dyn TxIntercept>,
    pub rx_special: Hook<dyn RxIntercept>,
}
