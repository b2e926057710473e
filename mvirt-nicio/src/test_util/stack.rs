//! Network stack double that records every callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::hooks::NetStack;
use crate::ids::{PayloadToken, PortId, TxQueueId};
use crate::packet::RxFrame;

/// A frame as the stack saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub port: PortId,
    pub rxq: usize,
    pub data: Vec<u8>,
    pub l4_csum_ok: bool,
}

#[derive(Default)]
struct Recorded {
    frames: Vec<ReceivedFrame>,
    held: Vec<RxFrame>,
    carrier: Vec<bool>,
    stopped: Vec<TxQueueId>,
    woken: Vec<TxQueueId>,
    released: Vec<PayloadToken>,
}

#[derive(Default)]
pub struct RecordingStack {
    recorded: Mutex<Recorded>,
    hold: AtomicBool,
}

impl RecordingStack {
    /// Copies frames and drops them, returning their buffers at once.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps received frames (and their buffers) until
    /// [`RecordingStack::take_held`].
    pub fn holding() -> Self {
        let stack = Self::default();
        stack.hold.store(true, Ordering::SeqCst);
        stack
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn frames(&self) -> Vec<ReceivedFrame> {
        self.lock().frames.clone()
    }

    pub fn frame_count(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn take_held(&self) -> Vec<RxFrame> {
        std::mem::take(&mut self.lock().held)
    }

    pub fn carrier(&self) -> Vec<bool> {
        self.lock().carrier.clone()
    }

    pub fn stopped(&self) -> Vec<TxQueueId> {
        self.lock().stopped.clone()
    }

    pub fn woken(&self) -> Vec<TxQueueId> {
        self.lock().woken.clone()
    }

    pub fn released(&self) -> Vec<PayloadToken> {
        self.lock().released.clone()
    }
}

impl NetStack for RecordingStack {
    fn receive(&self, port: PortId, frame: RxFrame) {
        let mut rec = self.lock();
        rec.frames.push(ReceivedFrame {
            port,
            rxq: frame.rxq(),
            data: frame.data().to_vec(),
            l4_csum_ok: frame.l4_csum_ok(),
        });
        if self.hold.load(Ordering::SeqCst) {
            rec.held.push(frame);
        }
    }

    fn carrier_changed(&self, _port: PortId, up: bool) {
        self.lock().carrier.push(up);
    }

    fn queue_stopped(&self, _port: PortId, txq: TxQueueId) {
        self.lock().stopped.push(txq);
    }

    fn queue_woken(&self, _port: PortId, txq: TxQueueId) {
        self.lock().woken.push(txq);
    }

    fn release_payload(&self, _port: PortId, token: PayloadToken) {
        self.lock().released.push(token);
    }
}
