//! Lock commands.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use clap::Subcommand;
use tokio::process::Command;
use tracing::info;

use super::interrupted;
use crate::cli::Client;
use crate::output::print_success;

#[derive(Subcommand)]
pub enum LockCommand {
    /// Acquire a lock and hold it until Ctrl-C.
    Hold(HoldArgs),

    /// Run a command while holding a lock.
    Exec(ExecArgs),
}

#[derive(Args)]
pub struct HoldArgs {
    pub key: String,

    /// Give up if the lock is not granted within this many milliseconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Args)]
pub struct ExecArgs {
    pub key: String,

    /// Give up if the lock is not granted within this many milliseconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Program and arguments to run.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl LockCommand {
    pub async fn run(self, client: &Client, json: bool) -> Result<()> {
        match self {
            LockCommand::Hold(args) => lock_hold(client, args, json).await,
            LockCommand::Exec(args) => lock_exec(client, args, json).await,
        }
    }
}

async fn acquire(client: &Client, key: &str, timeout: Option<u64>) -> Result<()> {
    match timeout {
        Some(ms) => client.lock_timeout(key, Duration::from_millis(ms)).await?,
        None => client.lock(key).await?,
    }
    Ok(())
}

async fn lock_hold(client: &Client, args: HoldArgs, json: bool) -> Result<()> {
    acquire(client, &args.key, args.timeout).await?;
    print_success(&format!("Lock '{}' acquired. Ctrl-C to release.", args.key), json);

    interrupted().await;

    client.unlock(&args.key).await?;
    print_success(&format!("Lock '{}' released.", args.key), json);
    Ok(())
}

async fn lock_exec(client: &Client, args: ExecArgs, json: bool) -> Result<()> {
    let Some((program, rest)) = args.command.split_first() else {
        anyhow::bail!("no command given");
    };

    acquire(client, &args.key, args.timeout).await?;
    info!(key = %args.key, program = %program, "lock acquired, running command");
    let status = Command::new(program).args(rest).status().await;
    client.unlock(&args.key).await?;

    let status = status?;
    if !status.success() {
        anyhow::bail!("{program} exited with {status}");
    }
    print_success(&format!("{program} finished under lock '{}'", args.key), json);
    Ok(())
}
