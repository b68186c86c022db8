//! Deterministic helpers with no I/O: key layouts, backoff and leader
//! classification. The async recipes call into these so the arithmetic and
//! string handling can be tested in isolation.

pub mod backoff;
pub mod election;
pub mod keys;

pub use backoff::BackoffResult;
pub use backoff::compute_backoff_with_jitter;
pub use election::LeaderObservation;
pub use election::observe_leader;
