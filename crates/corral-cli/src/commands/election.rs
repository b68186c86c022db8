//! Election commands.

use anyhow::Result;
use clap::Args;
use clap::Subcommand;
use corral_coordination::CoordinationError;

use super::interrupted;
use crate::cli::Client;
use crate::output::LeadershipOutput;
use crate::output::print_output;
use crate::output::print_success;

#[derive(Subcommand)]
pub enum ElectionCommand {
    /// Join an election and print every observation until Ctrl-C.
    Run(RunArgs),

    /// Print the current leader.
    Leader(LeaderArgs),
}

#[derive(Args)]
pub struct RunArgs {
    pub key: String,
}

#[derive(Args)]
pub struct LeaderArgs {
    pub key: String,
}

impl ElectionCommand {
    pub async fn run(self, client: &Client, json: bool) -> Result<()> {
        match self {
            ElectionCommand::Run(args) => election_run(client, args, json).await,
            ElectionCommand::Leader(args) => election_leader(client, args, json).await,
        }
    }
}

async fn election_run(client: &Client, args: RunArgs, json: bool) -> Result<()> {
    let (id, mut events) = client.subscribe_election(&args.key).await?;

    let stop = interrupted();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Some(event) => print_output(&LeadershipOutput { key: &args.key, event: &event }, json),
                None => break,
            },
        }
    }

    client.destroy_election(id).await;
    Ok(())
}

async fn election_leader(client: &Client, args: LeaderArgs, json: bool) -> Result<()> {
    match client.leader(&args.key).await {
        Ok(leader) => print_success(&leader, json),
        Err(CoordinationError::NoLeader { .. }) => print_success("no leader", json),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
