//! Core types for corral: the [`CoordinationStore`] seam, key-value request and
//! response types, leases, watch streams and store errors.
//!
//! Backends (`corral-etcd`, and the deterministic test store in `corral-testing`)
//! implement [`CoordinationStore`]; the primitives in `corral-coordination` only
//! ever talk to the trait.

pub mod constants;
mod error;
mod kv;
mod lease;
mod traits;
mod watch;

pub use error::StoreError;
pub use kv::Compare;
pub use kv::CompareOp;
pub use kv::CompareTarget;
pub use kv::DeleteRequest;
pub use kv::DeleteResult;
pub use kv::KeyValue;
pub use kv::LeaseId;
pub use kv::PutRequest;
pub use kv::PutResult;
pub use kv::RangeRequest;
pub use kv::RangeResult;
pub use kv::Revision;
pub use kv::SortOrder;
pub use kv::SortTarget;
pub use kv::TxnOp;
pub use kv::TxnOpResult;
pub use kv::TxnRequest;
pub use kv::TxnResult;
pub use lease::LeaseGrant;
pub use lease::LeaseTimeToLive;
pub use traits::CoordinationStore;
pub use watch::EventType;
pub use watch::WatchBatch;
pub use watch::WatchEvent;
pub use watch::WatchRequest;
pub use watch::WatchStream;
