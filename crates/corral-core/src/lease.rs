//! Lease types.

use crate::kv::LeaseId;

/// A granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Lease identifier.
    pub id: LeaseId,
    /// TTL in seconds, as accepted by the store.
    pub ttl_secs: i64,
}

/// Remaining lifetime of a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTimeToLive {
    /// Lease identifier.
    pub id: LeaseId,
    /// Remaining TTL in seconds, -1 if the lease expired or never existed.
    pub ttl_secs: i64,
    /// TTL the lease was granted with.
    pub granted_ttl_secs: i64,
    /// Keys attached to the lease.
    pub keys: Vec<String>,
}

impl LeaseTimeToLive {
    /// True if the store no longer knows the lease.
    pub fn is_expired(&self) -> bool {
        self.ttl_secs < 0
    }
}
