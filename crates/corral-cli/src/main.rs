//! corral - command-line access to etcd-backed coordination primitives.
//!
//! # Usage
//!
//! ```bash
//! # Hold a lock until Ctrl-C
//! corral --endpoints http://127.0.0.1:2379 lock hold reindex
//!
//! # Campaign for leadership and print every observation
//! corral --node-name worker-1 election run /election/scheduler
//!
//! # Queue work and take it back out
//! corral queue push jobs "compact segment 7" --priority 1
//! corral --json queue pop jobs
//!
//! # Stream changes under a prefix
//! corral watch /config/
//! ```

mod cli;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

/// Initialize tracing with `RUST_LOG` filtering.
fn init_tracing(quiet: bool, verbose: bool) {
    let filter = if quiet {
        EnvFilter::new("off")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.global.is_quiet, cli.global.is_verbose);

    cli.run().await
}
