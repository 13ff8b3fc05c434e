//! One binary, one workload per run. The harness launches the chosen
//! node and speaks newline-delimited JSON over stdin/stdout; logs go to
//! stderr so they never mix with the protocol stream.

use clap::{Parser, Subcommand};
use skein_core::{NodeBuilder, NodeError};
use tracing_subscriber::EnvFilter;

mod stateless;

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "Distributed workload nodes speaking newline-delimited JSON over stdio")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    workload: Workload,
}

#[derive(Subcommand)]
enum Workload {
    /// Echo every request's payload back to its sender
    Echo,
    /// Hand out cluster-wide unique ids
    UniqueIds,
    /// Gossip broadcast with batching and retransmission
    Broadcast,
    /// Grow-only counter flushed into seq-kv
    Counter,
    /// Sharded append-only logs backed by lin-kv
    Log,
    /// Eventually consistent transactional key-value store
    Kv,
}

impl Workload {
    fn builder(self) -> Result<NodeBuilder, NodeError> {
        match self {
            Workload::Echo => stateless::echo(),
            Workload::UniqueIds => stateless::unique_ids(),
            Workload::Broadcast => skein_broadcast::builder(Default::default()),
            Workload::Counter => skein_counter::builder(Default::default()),
            Workload::Log => skein_log::builder(Default::default()),
            Workload::Kv => skein_vkv::builder(Default::default()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), NodeError> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    Cli::parse().workload.builder()?.serve_stdio().await
}
