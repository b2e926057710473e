//! Per-port worker threads
//!
//! Each started port gets one worker that owns its poll sessions:
//! - interrupt wake-ups arrive through a channel set as the port's waker
//! - a fallback session runs every fallback interval, reclaiming TX even
//!   when no TX-done interrupt fired
//!
//! Only the worker polls its port, so two sessions never run at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::ids::PortId;
use crate::poll::PollOutcome;
use crate::port::Port;

/// Configuration for a worker thread
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Packets per poll session
    pub budget: usize,
    /// Period of the fallback session
    pub fallback_interval: Duration,
}

/// Handle to a running worker
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    wake: Sender<()>,
    pub port_id: PortId,
}

impl WorkerHandle {
    /// Signal the worker to stop
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> std::result::Result<(), String> {
        self.stop();
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| "Worker thread panicked".to_string())
        } else {
            Ok(())
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the worker thread of `port` and install its waker.
pub fn spawn_worker(port: Arc<Port>, config: WorkerConfig) -> Result<WorkerHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let (wake, wake_rx) = crossbeam_channel::bounded(1);
    let port_id = port.id();
    port.set_waker(Some(wake.clone()));

    let thread = thread::Builder::new()
        .name(format!("nicio-{port_id}"))
        .spawn(move || run_worker(port, config, wake_rx, shutdown_clone))
        .map_err(|e| {
            error!(port = %port_id, error = %e, "Failed to spawn worker thread");
            Error::Io(e)
        })?;

    Ok(WorkerHandle {
        thread: Some(thread),
        shutdown,
        wake,
        port_id,
    })
}

fn run_worker(port: Arc<Port>, config: WorkerConfig, wake: Receiver<()>, shutdown: Arc<AtomicBool>) {
    info!(port = %port.id(), budget = config.budget, "Worker started");

    while !shutdown.load(Ordering::SeqCst) {
        let fallback = match wake.recv_timeout(config.fallback_interval) {
            Ok(()) => false,
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let mut sessions = 0u64;
        loop {
            let summary = if fallback && sessions == 0 {
                port.poll_fallback(config.budget)
            } else {
                port.poll(config.budget)
            };
            sessions += 1;
            if summary.outcome == PollOutcome::Idle || shutdown.load(Ordering::SeqCst) {
                break;
            }
        }
        if sessions > 1 {
            debug!(port = %port.id(), sessions, "Worker drained backlog");
        }
    }

    port.set_waker(None);
    info!(port = %port.id(), "Worker stopped");
}
