//! Key update simulator.
//!
//! # Usage
//!
//! ```bash
//! # Update on every packet over a perfect link
//! keyphase-sim --packets 1000 --interval 1
//!
//! # Same, with 10% loss and 20% reordering in each direction
//! keyphase-sim --loss 0.1 --reorder 0.2 --seed 7
//! ```

use std::time::Duration;

use clap::Parser;
use keyphase_harness::{SimConfig, Simulation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Deterministic QUIC key update simulator
#[derive(Parser, Debug)]
#[command(name = "keyphase-sim")]
#[command(about = "Simulate 1-RTT key updates between two endpoints")]
#[command(version)]
struct Args {
    /// Packets each endpoint sends
    #[arg(short, long, default_value_t = 1000)]
    packets: u64,

    /// Packets per key generation before a local update
    #[arg(short, long, default_value_t = 1)]
    interval: u64,

    /// Fraction of datagrams lost (0.0 to 1.0)
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// Fraction of datagrams reordered (0.0 to 1.0)
    #[arg(long, default_value_t = 0.0)]
    reorder: f64,

    /// RNG seed
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Virtual milliseconds per round
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = SimConfig {
        packets: args.packets,
        packet_interval: args.interval,
        loss: args.loss,
        reorder: args.reorder,
        seed: args.seed,
        tick: Duration::from_millis(args.tick_ms),
        ..SimConfig::default()
    };
    tracing::info!(?config, "starting simulation");

    let report = Simulation::new(config)?.run();

    for endpoint in [&report.client, &report.server] {
        tracing::info!(
            role = ?endpoint.role,
            sent = endpoint.stats.sent,
            received = endpoint.stats.received,
            dropped = endpoint.stats.dropped,
            local_generation = endpoint.local_generation,
            remote_generation = endpoint.remote_generation,
            sent_transitions = endpoint.sent_transitions,
            received_transitions = endpoint.received_transitions,
            "endpoint summary"
        );
    }
    tracing::info!(to_server = ?report.to_server, to_client = ?report.to_client, "link summary");

    if report.is_clean() {
        return Ok(());
    }
    for (round, violation) in &report.violations {
        tracing::error!(round, %violation, "invariant violated");
    }
    Err(format!("{} invariant violations", report.violations.len()).into())
}
