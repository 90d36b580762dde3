use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{
    client::RpcConfig,
    node::{NodeConfig, Workload},
    retry::RetryPolicy,
    server::ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reply to `echo` requests with the same text.
    Echo(RpcArgs),
    /// Hand out cluster-wide unique ids for `generate` requests.
    UniqueIds(RpcArgs),
    /// Gossip `broadcast` values to topology neighbors.
    Broadcast(RpcArgs),
}

impl Command {
    pub fn node_config(&self) -> NodeConfig {
        let (workload, args) = match self {
            Command::Echo(args) => (Workload::Echo, args),
            Command::UniqueIds(args) => (Workload::UniqueIds, args),
            Command::Broadcast(args) => (Workload::Broadcast, args),
        };
        NodeConfig {
            workload,
            rpc: args.rpc_config(),
            server: ServerConfig {
                drain_timeout: Duration::from_millis(args.drain_timeout_ms),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RpcArgs {
    /// How long one rpc attempt waits for its response.
    #[arg(long, default_value_t = 300)]
    pub rpc_timeout_ms: u64,

    /// Attempts per rpc, including the first. Gossip ignores this and retries until acknowledged.
    #[arg(long, default_value_t = 3)]
    pub retry_times: u32,

    /// Backoff before the second attempt; doubles per attempt.
    #[arg(long, default_value_t = 100)]
    pub retry_initial_delay_ms: u64,

    /// Upper bound for the backoff delay.
    #[arg(long, default_value_t = 1000)]
    pub retry_max_delay_ms: u64,

    /// Grace period for in-flight handlers after stdin closes.
    #[arg(long, default_value_t = 1000)]
    pub drain_timeout_ms: u64,
}

impl RpcArgs {
    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            timeout: Duration::from_millis(self.rpc_timeout_ms),
            retry: RetryPolicy::new(
                self.retry_times,
                Duration::from_millis(self.retry_initial_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            ),
        }
    }
}
