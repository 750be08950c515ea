mod common;
mod events;
mod glare;
mod sync;

use clap::{Parser, Subcommand};
use events::{emit, EventSummary};
use peerlog_protocol::BrokerConfig;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "peerlog-sim", about = "In-process simulation of peerlog brokers and log sync")]
struct Cli {
    /// Artificial relay latency per envelope, in ms.
    #[arg(long, default_value = "5")]
    relay_delay: u64,

    /// Broker internal event channel capacity.
    #[arg(long, default_value = "64")]
    event_buffer: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Two brokers connect to each other simultaneously; check glare resolution.
    Glare {
        /// Number of independent rounds.
        #[arg(long, default_value = "10")]
        rounds: u32,
    },

    /// Replicate one log to N peers over brokered sessions.
    Sync {
        /// Items in the source log.
        #[arg(long, default_value = "1000")]
        items: u64,
        /// Batch size the replicas advertise.
        #[arg(long, default_value = "200")]
        batch_size: u64,
        /// Number of replicas.
        #[arg(long, default_value = "3")]
        peers: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();
    let broker = BrokerConfig::new().event_buffer(cli.event_buffer);

    eprintln!("peerlog-sim v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();

    let ok = match cli.command {
        Command::Glare { rounds } => {
            let ok = glare::run(
                glare::GlareConfig {
                    rounds,
                    relay_delay_ms: cli.relay_delay,
                    broker,
                },
                start,
            )
            .await?;
            emit(&EventSummary {
                event: "summary",
                mode: "glare".into(),
                ok,
                metrics: serde_json::Value::Null,
                elapsed_s: common::elapsed_s(start),
            });
            ok
        }

        Command::Sync {
            items,
            batch_size,
            peers,
        } => {
            let (ok, log) = sync::run(
                sync::SyncConfig {
                    items,
                    batch_size,
                    peers,
                    relay_delay_ms: cli.relay_delay,
                    broker,
                },
                start,
            )
            .await?;
            emit(&EventSummary {
                event: "summary",
                mode: "sync".into(),
                ok,
                metrics: log.metrics(),
                elapsed_s: common::elapsed_s(start),
            });
            ok
        }
    };

    if !ok {
        anyhow::bail!("simulation checks failed");
    }
    Ok(())
}
