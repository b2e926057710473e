//! Coalesced one-shot retry timer.
//!
//! Refill failures arm the timer through a [`RetryHandle`]; arming while a
//! retry is already pending does nothing. When the timer fires it runs the
//! task once, and re-arms itself if the task reports unfinished work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, trace};

enum Msg {
    Arm,
    Shutdown,
}

/// Cloneable arming side of a [`RetryTimer`].
#[derive(Clone)]
pub struct RetryHandle {
    pending: Arc<AtomicBool>,
    tx: Sender<Msg>,
}

impl RetryHandle {
    /// A handle not attached to any timer. Arming only records the pending
    /// flag; the owner drives retries by hand.
    pub fn detached() -> Self {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        Self {
            pending: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// Request a retry. Returns false if one was already pending.
    pub fn arm(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.tx.try_send(Msg::Arm) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                trace!("Retry armed without a timer");
            }
        }
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Clear the pending flag without running anything.
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

/// Timer thread running a retry task `interval` after being armed.
pub struct RetryTimer {
    handle: RetryHandle,
    fires: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl RetryTimer {
    /// Spawn the timer. `task` returns true while work remains.
    pub fn spawn<F>(interval: Duration, task: F) -> std::io::Result<Self>
    where
        F: Fn() -> bool + Send + 'static,
    {
        // Capacity 2: one pending arm plus room for the shutdown message.
        let (tx, rx) = crossbeam_channel::bounded(2);
        let handle = RetryHandle {
            pending: Arc::new(AtomicBool::new(false)),
            tx,
        };
        let fires = Arc::new(AtomicU64::new(0));

        let thread_handle = handle.clone();
        let thread_fires = fires.clone();
        let thread = thread::Builder::new()
            .name("nicio-retry".to_string())
            .spawn(move || run(rx, thread_handle, thread_fires, interval, task))?;

        info!(interval_ms = interval.as_millis() as u64, "Retry timer started");

        Ok(Self {
            handle,
            fires,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> RetryHandle {
        self.handle.clone()
    }

    /// Number of times the task has run.
    pub fn fires(&self) -> u64 {
        self.fires.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        // Blocking send: the channel always has room once the timer drains
        // its single pending arm.
        let _ = self.handle.tx.send(Msg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<F>(rx: Receiver<Msg>, handle: RetryHandle, fires: Arc<AtomicU64>, interval: Duration, task: F)
where
    F: Fn() -> bool,
{
    loop {
        match rx.recv() {
            Ok(Msg::Arm) => {}
            Ok(Msg::Shutdown) | Err(_) => break,
        }

        match rx.recv_timeout(interval) {
            Ok(Msg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Msg::Arm) | Err(RecvTimeoutError::Timeout) => {}
        }

        handle.clear();
        fires.fetch_add(1, Ordering::Relaxed);
        if task() {
            debug!("Retry incomplete, re-arming");
            handle.arm();
        }
    }
    debug!("Retry timer stopped");
}
