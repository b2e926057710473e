//! Process-wide engine state: pools, ports, the retry timer and workers.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::device::DeviceRegisters;
use crate::error::{Error, Result};
use crate::ids::PortId;
use crate::pool::{PoolSet, PoolStats};
use crate::port::{Port, PortStats};
use crate::retry::RetryTimer;
use crate::worker::{WorkerConfig, WorkerHandle, spawn_worker};

/// Snapshot of every pool and port.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pools: Vec<PoolStats>,
    pub ports: Vec<PortStats>,
    pub retry_fires: u64,
}

pub struct Engine {
    config: EngineConfig,
    pools: Arc<PoolSet>,
    ports: Arc<RwLock<Vec<Arc<Port>>>>,
    retry: RetryTimer,
    workers: Vec<WorkerHandle>,
}

impl Engine {
    /// Validate `config`, create its pools and ports and start the retry
    /// timer. `device` supplies the register layer of each port.
    pub fn init<F>(config: EngineConfig, mut device: F) -> Result<Self>
    where
        F: FnMut(PortId) -> Box<dyn DeviceRegisters>,
    {
        config.validate()?;

        let pools = Arc::new(PoolSet::new());
        for pool in &config.pools {
            pools.create(pool.size_class, pool.capacity)?;
        }

        let ports: Arc<RwLock<Vec<Arc<Port>>>> = Arc::new(RwLock::new(Vec::new()));
        let retry_ports = Arc::downgrade(&ports);
        let retry = RetryTimer::spawn(Duration::from_millis(config.retry_interval_ms), move || {
            let Some(ports) = retry_ports.upgrade() else {
                return false;
            };
            let ports = ports.read().unwrap_or_else(|e| e.into_inner()).clone();
            refill_all(&ports)
        })?;

        {
            let mut list = ports.write().unwrap_or_else(|e| e.into_inner());
            for (i, port_config) in config.ports.iter().enumerate() {
                let id = PortId(u16::try_from(i).map_err(|_| {
                    Error::ResourceExhausted("no free port identifier".to_string())
                })?);
                let port = Port::new(id, port_config, device(id), pools.clone(), retry.handle())?;
                list.push(Arc::new(port));
            }
        }

        info!(
            pools = config.pools.len(),
            ports = config.ports.len(),
            "Engine initialized"
        );

        Ok(Self {
            config,
            pools,
            ports,
            retry,
            workers: Vec::new(),
        })
    }

    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.ports.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn port(&self, id: PortId) -> Result<Arc<Port>> {
        self.ports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id.index())
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn start_port(&self, id: PortId) -> Result<()> {
        self.port(id)?.start()
    }

    pub fn stop_port(&self, id: PortId) -> Result<()> {
        self.port(id)?.stop()
    }

    /// Start every port, stopping at the first failure.
    pub fn start_all(&self) -> Result<()> {
        for port in self.ports() {
            port.start()?;
        }
        Ok(())
    }

    pub fn stop_all(&self) -> Result<()> {
        for port in self.ports() {
            port.stop()?;
        }
        Ok(())
    }

    /// One worker thread per port.
    pub fn spawn_workers(&mut self) -> Result<()> {
        let config = WorkerConfig {
            budget: self.config.poll.budget,
            fallback_interval: Duration::from_millis(self.config.poll.fallback_interval_ms),
        };
        for port in self.ports() {
            if self.workers.iter().any(|w| w.port_id == port.id()) {
                continue;
            }
            self.workers.push(spawn_worker(port, config)?);
        }
        Ok(())
    }

    pub fn stop_workers(&mut self) {
        for worker in self.workers.drain(..) {
            let id = worker.port_id;
            if let Err(e) = worker.join() {
                warn!(port = %id, error = %e, "Worker did not stop cleanly");
            }
        }
    }

    /// Retry deferred RX refills on every port. Returns true while some
    /// slot is still unarmed.
    pub fn retry_refills(&self) -> bool {
        refill_all(&self.ports())
    }

    /// Number of times the retry timer has fired.
    pub fn retry_fires(&self) -> u64 {
        self.retry.fires()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            pools: self.pools.stats(),
            ports: self.ports().iter().map(|p| p.stats()).collect(),
            retry_fires: self.retry.fires(),
        }
    }

    /// Stop workers and ports, then destroy every pool. Fails with `Busy`
    /// if buffers are still held outside the engine; the engine is torn
    /// down as far as possible either way.
    pub fn teardown(mut self) -> Result<()> {
        self.stop_workers();
        let stopped = self.stop_all();
        self.ports.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.retry.stop();

        let mut busy = None;
        for id in self.pools.ids() {
            if let Err(e) = self.pools.destroy(id) {
                warn!(pool = %id, error = %e, "Pool not destroyed");
                busy.get_or_insert(e);
            }
        }
        stopped?;
        if let Some(e) = busy {
            return Err(e);
        }
        info!("Engine torn down");
        Ok(())
    }
}

fn refill_all(ports: &[Arc<Port>]) -> bool {
    let mut remaining = 0;
    for port in ports {
        remaining += port.refill_deferred();
    }
    remaining > 0
}
