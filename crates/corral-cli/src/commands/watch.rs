//! Watch command.

use anyhow::Result;
use clap::Args;

use super::interrupted;
use crate::cli::Client;
use crate::output::WatchOutput;
use crate::output::print_output;

#[derive(Args)]
pub struct WatchArgs {
    /// Prefix to watch.
    pub prefix: String,
}

impl WatchArgs {
    pub async fn run(self, client: &Client, json: bool) -> Result<()> {
        let (id, mut notifications) = client.subscribe(&self.prefix)?;

        let stop = interrupted();
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => print_output(&WatchOutput(&notification), json),
                    None => break,
                },
            }
        }

        client.stop_watcher(id).await;
        Ok(())
    }
}
