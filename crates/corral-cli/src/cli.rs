//! Argument parsing and command dispatch.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use corral_coordination::CoordinationClient;
use corral_etcd::EtcdStore;
use tracing::debug;

use crate::commands::election::ElectionCommand;
use crate::commands::kv::KvCommand;
use crate::commands::lock::LockCommand;
use crate::commands::queue::QueueCommand;
use crate::commands::service::ServiceArgs;
use crate::commands::watch::WatchArgs;
use crate::config::CliConfig;

/// Client type every command runs against.
pub type Client = CoordinationClient<EtcdStore>;

/// Distributed locks, elections, watchers and queues on etcd.
#[derive(Parser)]
#[command(name = "corral")]
#[command(version)]
#[command(about = "Distributed locks, elections, watchers and priority queues on etcd")]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command.
#[derive(Args, Clone)]
pub struct GlobalOptions {
    /// TOML configuration file.
    #[arg(long, env = "CORRAL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// etcd endpoints, comma separated.
    #[arg(long, env = "CORRAL_ENDPOINTS", value_delimiter = ',', global = true)]
    pub endpoints: Vec<String>,

    /// Node identity used in elections.
    #[arg(long, global = true)]
    pub node_name: Option<String>,

    /// Per-request timeout in milliseconds.
    #[arg(long = "timeout", global = true)]
    pub timeout_ms: Option<u64>,

    /// Print JSON instead of human-readable output.
    #[arg(long = "json", global = true)]
    pub is_json: bool,

    /// Enable debug logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub is_verbose: bool,

    /// Suppress all logging.
    #[arg(short = 'q', long = "quiet", global = true)]
    pub is_quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read and write keys.
    #[command(subcommand)]
    Kv(KvCommand),

    /// Keyed mutual exclusion.
    #[command(subcommand)]
    Lock(LockCommand),

    /// Leader election.
    #[command(subcommand)]
    Election(ElectionCommand),

    /// Stream changes under a prefix.
    Watch(WatchArgs),

    /// Priority queues.
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Keep a service registration alive.
    Service(ServiceArgs),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let mut config = CliConfig::load(self.global.config.as_deref())?;
        config.apply_flags(&self.global.endpoints, self.global.node_name.as_deref(), self.global.timeout_ms);
        debug!(endpoints = ?config.etcd.endpoints, node = %config.coordination.node_name, "connecting");

        let store = EtcdStore::connect(&config.etcd)
            .await
            .with_context(|| format!("failed to connect to {}", config.etcd.endpoints.join(",")))?;
        let client = CoordinationClient::new(Arc::new(store), config.coordination)?;

        let json = self.global.is_json;
        let result = match self.command {
            Commands::Kv(cmd) => cmd.run(&client, json).await,
            Commands::Lock(cmd) => cmd.run(&client, json).await,
            Commands::Election(cmd) => cmd.run(&client, json).await,
            Commands::Watch(args) => args.run(&client, json).await,
            Commands::Queue(cmd) => cmd.run(&client, json).await,
            Commands::Service(args) => args.run(&client, json).await,
        };

        client.close().await;
        result
    }
}
