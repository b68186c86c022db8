//! Test support for the corral crates.
//!
//! [`DeterministicCoordinationStore`] is an in-memory stand-in for etcd used by
//! every unit and integration test in the workspace.

mod store;

pub use store::DeterministicCoordinationStore;
