//! Priority queue commands.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use clap::Subcommand;

use crate::cli::Client;
use crate::output::PopOutput;
use crate::output::print_output;
use crate::output::print_success;

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Add an entry.
    Push(PushArgs),

    /// Remove and print the first entry.
    Pop(PopArgs),

    /// Print the number of entries.
    Len(NameArgs),

    /// List queues under a namespace.
    List(ListArgs),

    /// Remove a queue and all of its entries.
    Delete(NameArgs),
}

#[derive(Args)]
pub struct PushArgs {
    pub name: String,

    pub value: String,

    /// Lower values are served first.
    #[arg(long, default_value = "0")]
    pub priority: u16,
}

#[derive(Args)]
pub struct PopArgs {
    pub name: String,

    /// Wait for an entry if the queue is empty.
    #[arg(long)]
    pub wait: bool,

    /// Stop waiting after this many milliseconds.
    #[arg(long, requires = "wait")]
    pub wait_timeout: Option<u64>,
}

#[derive(Args)]
pub struct NameArgs {
    pub name: String,
}

#[derive(Args)]
pub struct ListArgs {
    /// Only list queues whose name starts with this.
    #[arg(default_value = "")]
    pub namespace: String,
}

impl QueueCommand {
    pub async fn run(self, client: &Client, json: bool) -> Result<()> {
        match self {
            QueueCommand::Push(args) => {
                let key = client.priority_queue(&args.name)?.push(&args.value, args.priority).await?;
                print_success(&format!("Pushed {key}"), json);
            }
            QueueCommand::Pop(args) => {
                let queue = client.priority_queue(&args.name)?;
                let item = match (args.wait, args.wait_timeout) {
                    (true, Some(ms)) => Some(queue.pop_timeout(Duration::from_millis(ms)).await?),
                    (true, None) => Some(queue.pop_wait().await?),
                    (false, _) => queue.pop().await?,
                };
                print_output(&PopOutput { queue: args.name, item }, json);
            }
            QueueCommand::Len(args) => {
                let len = client.priority_queue(&args.name)?.len().await?;
                print_success(&len.to_string(), json);
            }
            QueueCommand::List(args) => {
                let names = client.priority_queue_list(&args.namespace).await?;
                if json {
                    println!("{}", serde_json::json!({ "queues": names }));
                } else if names.is_empty() {
                    println!("No queues found.");
                } else {
                    println!("{}", names.join("\n"));
                }
            }
            QueueCommand::Delete(args) => {
                let deleted = client.priority_queue(&args.name)?.delete().await?;
                print_success(&format!("Deleted queue '{}' ({deleted} entries)", args.name), json);
            }
        }
        Ok(())
    }
}
