//! Key-value commands.

use anyhow::Result;
use clap::Args;
use clap::Subcommand;

use crate::cli::Client;
use crate::output::KvOutput;
use crate::output::print_output;
use crate::output::print_success;

#[derive(Subcommand)]
pub enum KvCommand {
    /// Write a key.
    Put(PutArgs),

    /// Read a key, or every key under a prefix.
    Get(GetArgs),

    /// Delete a key, or every key under a prefix.
    Delete(DeleteArgs),
}

#[derive(Args)]
pub struct PutArgs {
    pub key: String,

    pub value: String,

    /// Attach the key to a new lease of this many seconds.
    #[arg(long)]
    pub ttl: Option<i64>,
}

#[derive(Args)]
pub struct GetArgs {
    pub key: String,

    /// Treat the key as a prefix.
    #[arg(long)]
    pub prefix: bool,

    /// Return at most this many entries.
    #[arg(long)]
    pub limit: Option<u32>,
}

#[derive(Args)]
pub struct DeleteArgs {
    pub key: String,

    /// Treat the key as a prefix.
    #[arg(long)]
    pub prefix: bool,
}

impl KvCommand {
    pub async fn run(self, client: &Client, json: bool) -> Result<()> {
        match self {
            KvCommand::Put(args) => kv_put(client, args, json).await,
            KvCommand::Get(args) => kv_get(client, args, json).await,
            KvCommand::Delete(args) => kv_delete(client, args, json).await,
        }
    }
}

async fn kv_put(client: &Client, args: PutArgs, json: bool) -> Result<()> {
    match args.ttl {
        Some(ttl) => {
            let lease = client.put_with_ttl(&args.key, &args.value, ttl).await?;
            print_success(&format!("OK (lease {lease:x})"), json);
        }
        None => {
            let revision = client.put(&args.key, &args.value).await?;
            print_success(&format!("OK (revision {revision})"), json);
        }
    }
    Ok(())
}

async fn kv_get(client: &Client, args: GetArgs, json: bool) -> Result<()> {
    let entries = if args.prefix {
        match args.limit {
            Some(limit) => {
                client.get_limit(&args.key, limit).await?.into_iter().map(|kv| (kv.key, kv.value)).collect()
            }
            None => client.get_kvs(&args.key).await?.into_iter().collect(),
        }
    } else {
        match client.get_one(&args.key).await? {
            Some(value) => vec![(args.key, value)],
            None => Vec::new(),
        }
    };
    print_output(&KvOutput { entries }, json);
    Ok(())
}

async fn kv_delete(client: &Client, args: DeleteArgs, json: bool) -> Result<()> {
    let deleted = if args.prefix {
        client.delete_with_prefix(&args.key).await?
    } else {
        client.delete(&args.key).await?
    };
    print_success(&format!("Deleted {deleted} key(s)"), json);
    Ok(())
}
