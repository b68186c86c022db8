//! etcd v3 implementation of [`corral_core::CoordinationStore`].
//!
//! This is the only production backend. It maps the store seam onto the
//! `etcd-client` KV, lease and watch services one call at a time; the lock,
//! election and queue recipes live in `corral-coordination` and never see etcd
//! types.

mod config;
mod convert;
mod store;

pub use config::EtcdConfig;
pub use convert::map_error;
pub use store::EtcdStore;
