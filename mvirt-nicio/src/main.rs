use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mvirt_nicio::Engine;
use mvirt_nicio::config::EngineConfig;
use mvirt_nicio::device::DeviceRegisters;
use mvirt_nicio::hooks::NetStack;
use mvirt_nicio::ids::{PortId, TxQueueId};
use mvirt_nicio::packet::{RxFrame, TxPacket};
use mvirt_nicio::port::Port;
use mvirt_nicio::test_util::SimDevice;
use mvirt_nicio::test_util::packets::ipv4_frame;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate an engine config file
    Check {
        /// Path to the JSON config
        config: PathBuf,
    },

    /// Run an echo workload over the software device and print statistics
    Simulate {
        /// Path to the JSON config (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Frames to inject per port
        #[arg(short, long, default_value = "1000")]
        frames: usize,

        /// Frame size in bytes
        #[arg(long, default_value = "128")]
        size: usize,

        /// Override the poll budget
        #[arg(long)]
        budget: Option<usize>,
    },
}

/// Sends every received frame back out of the port it arrived on.
#[derive(Default)]
struct EchoStack {
    ports: RwLock<HashMap<PortId, Weak<Port>>>,
    echoed: AtomicU64,
    dropped: AtomicU64,
    stops: AtomicU64,
}

impl EchoStack {
    fn attach(self: &Arc<Self>, port: &Arc<Port>) {
        self.ports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port.id(), Arc::downgrade(port));
        port.attach_stack(self.clone());
    }
}

impl NetStack for EchoStack {
    fn receive(&self, port: PortId, frame: RxFrame) {
        let target = self
            .ports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&port)
            .and_then(Weak::upgrade);
        let Some(target) = target else {
            return;
        };
        if target
            .submit(TxPacket::from_buffer(frame.into_buffer()), None)
            .is_queued()
        {
            self.echoed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn queue_stopped(&self, port: PortId, txq: TxQueueId) {
        self.stops.fetch_add(1, Ordering::Relaxed);
        info!(%port, %txq, "TX queue stopped");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_nicio=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Check { config } => check(config),
        Commands::Simulate {
            config,
            frames,
            size,
            budget,
        } => simulate(config, frames, size, budget),
    }
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = EngineConfig::from_file(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    println!(
        "{}: ok ({} pools, {} ports)",
        path.display(),
        config.pools.len(),
        config.ports.len()
    );
    Ok(())
}

fn simulate(
    path: Option<PathBuf>,
    frames: usize,
    size: usize,
    budget: Option<usize>,
) -> anyhow::Result<()> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(budget) = budget {
        config.poll.budget = budget;
    }

    let mut devices = Vec::new();
    let mut engine = Engine::init(config, |id| {
        let dev = SimDevice::new(1);
        dev.set_auto_complete(true);
        devices.push((id, dev.clone()));
        Box::new(dev) as Box<dyn DeviceRegisters>
    })?;

    let stack = Arc::new(EchoStack::default());
    for port in engine.ports() {
        stack.attach(&port);
    }
    engine.start_all()?;
    engine.spawn_workers()?;

    let frame = ipv4_frame(0, size);
    let started = Instant::now();
    for _ in 0..frames {
        for (id, dev) in &devices {
            let port = engine.port(*id)?;
            let deadline = Instant::now() + Duration::from_secs(1);
            while !dev.inject_rx(0, &frame) {
                port.interrupt();
                if Instant::now() > deadline {
                    bail!("{id} stopped accepting frames");
                }
                thread::yield_now();
            }
            port.interrupt();
        }
    }

    let expected = (frames * devices.len()) as u64;
    let deadline = Instant::now() + Duration::from_secs(5);
    while stack.echoed.load(Ordering::Relaxed) + stack.dropped.load(Ordering::Relaxed) < expected {
        if Instant::now() > deadline {
            warn!("Timed out waiting for echoes");
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    let elapsed = started.elapsed();

    engine.stop_workers();
    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    println!(
        "echoed {} of {} frames ({} dropped, {} queue stops) in {:?}",
        stack.echoed.load(Ordering::Relaxed),
        expected,
        stack.dropped.load(Ordering::Relaxed),
        stack.stops.load(Ordering::Relaxed),
        elapsed
    );

    engine.teardown()?;
    Ok(())
}
