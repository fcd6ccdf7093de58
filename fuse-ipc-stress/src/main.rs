//! Stress harness for the fuse-ipc dispatch engine.
//!
//! Runs caller threads against a simulated daemon, either driving the device
//! directly or through a socket pair bridged by `fuse_ipc::transport`, and
//! reports per-worker results, session statistics and latency histograms.
//!
//! Usage:
//!   # Direct device, 8 callers, every 50th request interrupted
//!   ./fuse-ipc-stress run --workers 8 --ops 10000 --interrupt-every 50
//!
//!   # Same traffic over a Unix socket pair
//!   ./fuse-ipc-stress run --socket-pair
//!
//!   # Print the default session configuration
//!   ./fuse-ipc-stress config > session.json

mod daemon;
mod metrics;
mod worker;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::{Daemon, DeviceWire, StreamWire, Wire};
use fuse_ipc::{transport, Device, Session, SessionConfig};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fuse-ipc-stress")]
#[command(about = "Stress harness for the fuse-ipc dispatch engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run callers against a simulated daemon
    Run {
        /// Number of caller threads
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Requests per caller
        #[arg(short, long, default_value = "1000")]
        ops: usize,

        /// Daemon worker threads
        #[arg(short, long, default_value = "4")]
        daemon_threads: usize,

        /// Simulated daemon latency per request, in microseconds
        #[arg(short, long, default_value = "50")]
        latency_us: u64,

        /// Interrupt every Nth request (0 = never)
        #[arg(short, long, default_value = "0")]
        interrupt_every: usize,

        /// Carry traffic over a Unix socket pair instead of the device
        #[arg(long)]
        socket_pair: bool,

        /// Session configuration (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print per-worker results as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print the default session configuration as JSON
    Config,
}

struct RunArgs {
    workers: usize,
    ops: usize,
    daemon_threads: usize,
    latency: Duration,
    interrupt_every: usize,
    socket_pair: bool,
    config: Option<PathBuf>,
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            workers,
            ops,
            daemon_threads,
            latency_us,
            interrupt_every,
            socket_pair,
            config,
            json,
        } => run(RunArgs {
            workers,
            ops,
            daemon_threads,
            latency: Duration::from_micros(latency_us),
            interrupt_every,
            socket_pair,
            config,
            json,
        }),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&SessionConfig::default())?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    metrics::init();

    let mut config = load_config(args.config.as_ref())?;
    if args.interrupt_every > 0 {
        config = config.allow_interrupt(true);
    }
    let session = Session::new(config);
    let device = Arc::new(Device::new(Arc::clone(&session)));

    let mut bridge = None;
    let wire: Arc<dyn Wire> = if args.socket_pair {
        let (engine_end, daemon_end) = UnixStream::pair()?;
        bridge = Some(transport::bridge(Arc::clone(&device), engine_end)?);
        Arc::new(StreamWire::new(daemon_end)?)
    } else {
        Arc::new(DeviceWire(Arc::clone(&device)))
    };
    let daemon = Daemon::spawn(wire, args.daemon_threads.max(1), args.latency)?;

    session.send_init()?;
    let caps = session
        .wait_init(Duration::from_secs(5))
        .context("daemon did not answer init")?;
    eprintln!(
        "[stress] protocol {} max_write={} workers={} ops={} transport={}",
        caps.abi,
        caps.max_write,
        args.workers,
        args.ops,
        if args.socket_pair { "socket-pair" } else { "device" }
    );

    let start = Instant::now();
    let results = thread::scope(|scope| {
        let handles: Vec<_> = (0..args.workers)
            .map(|id| {
                let session = &session;
                scope.spawn(move || worker::run_worker(session, id, args.ops, args.interrupt_every))
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .collect::<Vec<_>>()
    });
    let elapsed = start.elapsed();

    if args.json {
        for result in &results {
            println!("{}", serde_json::to_string(result)?);
        }
    }
    let failed: usize = results.iter().map(|r| r.errors.other + r.errors.closed).sum();

    eprintln!(
        "[stress] session stats: {}",
        serde_json::to_string_pretty(&session.stats())?
    );
    match metrics::snapshot() {
        Some(entries) => {
            metrics::print_snapshot(&entries);
            let summary = metrics::get_summary(&entries, elapsed.as_secs_f64());
            eprintln!("[stress] summary: {}", serde_json::to_string(&summary)?);
        }
        None => eprintln!("[metrics] not initialized"),
    }

    session.destroy();
    daemon.join();
    if let Some(bridge) = bridge {
        bridge.join();
    }

    anyhow::ensure!(failed == 0, "{failed} requests failed unexpectedly");
    eprintln!("[stress] done in {:.2}s", elapsed.as_secs_f64());
    Ok(())
}
