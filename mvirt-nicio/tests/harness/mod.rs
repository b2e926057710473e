//! Test harness for engine integration tests
//!
//! Builds an engine over simulated devices with a recording stack attached
//! to every port.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mvirt_nicio::Engine;
use mvirt_nicio::config::{EngineConfig, PoolConfig, PortConfig};
use mvirt_nicio::device::DeviceRegisters;
use mvirt_nicio::ids::{PayloadToken, TxQueueId};
use mvirt_nicio::packet::{Fragment, TxPacket};
use mvirt_nicio::pool::BufferPool;
use mvirt_nicio::port::Port;
use mvirt_nicio::test_util::packets::ipv4_frame;
use mvirt_nicio::test_util::{RecordingStack, SimDevice};

pub const Q0: TxQueueId = TxQueueId { txp: 0, txq: 0 };
pub const Q1: TxQueueId = TxQueueId { txp: 0, txq: 1 };

pub struct TestPort {
    pub engine: Engine,
    pub port: Arc<Port>,
    pub dev: SimDevice,
    pub stack: Arc<RecordingStack>,
}

impl TestPort {
    /// Pool the started port draws its buffers from.
    pub fn pool(&self) -> Arc<BufferPool> {
        let id = self.port.stats().pool.expect("port has no pool");
        self.engine.pools().get(id).expect("pool exists")
    }

    /// A pool-buffer packet carrying an IPv4 frame.
    pub fn packet(&self, tos: u8, len: usize) -> TxPacket {
        let mut buf = self.pool().get().expect("pool buffer");
        buf.fill_from(&ipv4_frame(tos, len));
        TxPacket::from_buffer(buf)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// An engine with one pool and one port per entry of `ports`.
pub fn engine(
    ports: Vec<PortConfig>,
    pool_capacity: usize,
    stack: Arc<RecordingStack>,
) -> (Engine, Vec<SimDevice>) {
    init_tracing();
    let config = EngineConfig {
        pools: vec![PoolConfig {
            size_class: 0,
            capacity: pool_capacity,
        }],
        ports,
        retry_interval_ms: 5,
        ..Default::default()
    };

    let mut devices = Vec::new();
    let engine = Engine::init(config, |_| {
        let dev = SimDevice::new(1);
        devices.push(dev.clone());
        Box::new(dev) as Box<dyn DeviceRegisters>
    })
    .expect("engine init");

    for port in engine.ports() {
        port.attach_stack(stack.clone());
    }
    (engine, devices)
}

/// A single started port.
pub fn started_port(config: PortConfig, pool_capacity: usize) -> TestPort {
    started_port_with(config, pool_capacity, RecordingStack::new())
}

pub fn started_port_with(
    config: PortConfig,
    pool_capacity: usize,
    stack: RecordingStack,
) -> TestPort {
    let stack = Arc::new(stack);
    let (engine, mut devices) = engine(vec![config], pool_capacity, stack.clone());
    let port = engine.ports().remove(0);
    port.start().expect("port start");
    TestPort {
        engine,
        port,
        dev: devices.remove(0),
        stack,
    }
}

/// A small port: one TX queue of `txq_size` descriptors, reclaim only by
/// poll sessions.
pub fn small_port(txq_size: usize, margin: usize) -> PortConfig {
    PortConfig {
        txq_size,
        tx_stop_margin: margin,
        txdone_threshold: 1024,
        pool_buffers: 32,
        ..Default::default()
    }
}

/// An externally owned packet of `frags` fragments.
pub fn external(token: u64, frags: usize) -> TxPacket {
    let fragments = (0..frags)
        .map(|i| Fragment {
            addr: 0x10_0000 + (i as u64) * 0x1000,
            len: 256,
        })
        .collect();
    TxPacket::external(PayloadToken(token), fragments, ipv4_frame(0, 64))
}

/// Poll until `cond` holds or two seconds pass.
pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}
