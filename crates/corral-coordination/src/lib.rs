//! Distributed coordination primitives over an etcd-style store.
//!
//! Everything is built on the [`corral_core::CoordinationStore`] trait: leases,
//! revision-guarded transactions and prefix watches.
//!
//! - [`SessionMutex`] - keyed mutual exclusion scoped to a lease-backed [`Session`]
//! - [`ElectionHandle`] - campaign and leadership observation loop
//! - [`WatcherHandle`] - reconnecting prefix watch with bounded dispatch
//! - [`PriorityQueue`] - ordered queue with at-most-once claim-by-delete
//! - [`ProviderHandle`] - service registration kept alive by a lease
//!
//! [`CoordinationClient`] owns the store handle and tracks every primitive it
//! creates, so that [`CoordinationClient::close`] can release them all.
//!
//! ## Example
//!
//! ```ignore
//! use corral_coordination::{CoordinationClient, CoordinationConfig};
//!
//! let client = CoordinationClient::new(store, CoordinationConfig::default())?;
//!
//! client.lock("reindex").await?;
//! // critical section
//! client.unlock("reindex").await?;
//!
//! let jobs = client.priority_queue("jobs")?;
//! jobs.push("compact-segment-7", 1).await?;
//! if let Some(item) = jobs.pop().await? {
//!     println!("{} at priority {}", item.value, item.priority);
//! }
//!
//! client.close().await;
//! ```

mod client;
mod config;
mod election;
mod error;
mod lock;
mod notify;
mod pool;
mod provider;
pub mod pure;
mod queue;
mod retry;
mod session;
mod watcher;

pub use client::CoordinationClient;
pub use client::HandleId;
pub use config::CoordinationConfig;
pub use config::ElectionConfig;
pub use config::QueueConfig;
pub use config::WatcherConfig;
pub use election::ElectionHandle;
pub use election::ElectionState;
pub use election::LeadershipEvent;
pub use error::ConfigError;
pub use error::CoordinationError;
pub use lock::SessionMutex;
pub use notify::Callback;
pub use pool::WorkerPool;
pub use provider::ProviderEvent;
pub use provider::ProviderHandle;
pub use queue::PriorityQueue;
pub use queue::QueueItem;
pub use queue::list_priority_queues;
pub use retry::WriteRetry;
pub use retry::with_timeout;
pub use session::Session;
pub use watcher::UpdateEvent;
pub use watcher::UpdateEventType;
pub use watcher::WatchNotification;
pub use watcher::WatcherHandle;
