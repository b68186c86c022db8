//! The store seam every coordination primitive is written against.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::kv::DeleteRequest;
use crate::kv::DeleteResult;
use crate::kv::LeaseId;
use crate::kv::PutRequest;
use crate::kv::PutResult;
use crate::kv::RangeRequest;
use crate::kv::RangeResult;
use crate::kv::TxnRequest;
use crate::kv::TxnResult;
use crate::lease::LeaseGrant;
use crate::lease::LeaseTimeToLive;
use crate::watch::WatchRequest;
use crate::watch::WatchStream;

/// Strongly-consistent key-value coordination service.
///
/// Provides linearizable reads and writes, conditional transactions, leases that
/// delete their attached keys on expiry, and revision-ordered prefix watches.
/// Locks, elections and queues are recipes layered over these calls.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a key or prefix.
    async fn range(&self, request: RangeRequest) -> Result<RangeResult, StoreError>;

    /// Write a key.
    async fn put(&self, request: PutRequest) -> Result<PutResult, StoreError>;

    /// Delete a key or prefix.
    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, StoreError>;

    /// Run a conditional transaction atomically.
    async fn txn(&self, request: TxnRequest) -> Result<TxnResult, StoreError>;

    /// Grant a lease with the given TTL in seconds.
    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrant, StoreError>;

    /// Refresh a lease once, returning its renewed TTL.
    async fn lease_keep_alive_once(&self, lease_id: LeaseId) -> Result<LeaseGrant, StoreError>;

    /// Revoke a lease, deleting every key attached to it.
    async fn lease_revoke(&self, lease_id: LeaseId) -> Result<(), StoreError>;

    /// Query the remaining lifetime of a lease.
    async fn lease_time_to_live(&self, lease_id: LeaseId) -> Result<LeaseTimeToLive, StoreError>;

    /// Open a watch stream.
    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, StoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: CoordinationStore + ?Sized> CoordinationStore for std::sync::Arc<T> {
    async fn range(&self, request: RangeRequest) -> Result<RangeResult, StoreError> {
        (**self).range(request).await
    }

    async fn put(&self, request: PutRequest) -> Result<PutResult, StoreError> {
        (**self).put(request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, StoreError> {
        (**self).delete(request).await
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResult, StoreError> {
        (**self).txn(request).await
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrant, StoreError> {
        (**self).lease_grant(ttl_secs).await
    }

    async fn lease_keep_alive_once(&self, lease_id: LeaseId) -> Result<LeaseGrant, StoreError> {
        (**self).lease_keep_alive_once(lease_id).await
    }

    async fn lease_revoke(&self, lease_id: LeaseId) -> Result<(), StoreError> {
        (**self).lease_revoke(lease_id).await
    }

    async fn lease_time_to_live(&self, lease_id: LeaseId) -> Result<LeaseTimeToLive, StoreError> {
        (**self).lease_time_to_live(lease_id).await
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, StoreError> {
        (**self).watch(request).await
    }
}
