//! Service registration command.

use anyhow::Result;
use clap::Args;
use corral_coordination::ProviderEvent;
use tracing::info;
use tracing::warn;

use super::interrupted;
use crate::cli::Client;
use crate::output::print_success;

#[derive(Args)]
pub struct ServiceArgs {
    /// Registration key, e.g. `/services/api/node-1`.
    pub key: String,

    /// Value stored under the key, typically an address.
    pub value: String,

    /// Lease TTL in seconds.
    #[arg(long, default_value = "10")]
    pub ttl: i64,
}

impl ServiceArgs {
    pub async fn run(self, client: &Client, json: bool) -> Result<()> {
        let key = self.key.clone();
        let id = client.new_provider(&self.key, &self.value, self.ttl, move |event| match event {
            ProviderEvent::Registered { lease_id } => info!(key = %key, lease_id, "registered"),
            ProviderEvent::Disconnected { error } => warn!(key = %key, error = %error, "registration lost"),
        })?;
        print_success(&format!("Registered '{}'. Ctrl-C to deregister.", self.key), json);

        interrupted().await;

        client.stop_provider(id).await;
        print_success(&format!("Deregistered '{}'.", self.key), json);
        Ok(())
    }
}
