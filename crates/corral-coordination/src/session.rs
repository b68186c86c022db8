//! Lease-backed liveness scope shared by locks and elections.
//!
//! A session grants one lease and refreshes it in the background every third
//! of its TTL. Keys written under the session's lease disappear when the
//! process dies or the session is closed.

use std::sync::Arc;
use std::time::Duration;

use corral_core::CoordinationStore;
use corral_core::LeaseId;
use corral_core::StoreError;
use corral_core::constants::MIN_SESSION_TTL_SECS;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFuture;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::CoordinationError;
use crate::retry::with_timeout;

/// A granted lease kept alive by a background task.
pub struct Session<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    lease_id: LeaseId,
    ttl_secs: i64,
    op_timeout: Duration,
    /// Stops the keep-alive task.
    cancel: CancellationToken,
    /// Fires once the store reports the lease gone.
    expired: CancellationToken,
}

impl<S: CoordinationStore + ?Sized + 'static> Session<S> {
    /// Grant a lease of `ttl_secs` and start refreshing it.
    ///
    /// The keep-alive task stops when `parent` is cancelled, when the session
    /// is closed or dropped, or when the lease is found expired.
    pub async fn new(
        store: Arc<S>,
        ttl_secs: i64,
        op_timeout: Duration,
        parent: &CancellationToken,
    ) -> Result<Self, CoordinationError> {
        if ttl_secs < MIN_SESSION_TTL_SECS {
            return Err(CoordinationError::InvalidParam {
                reason: format!("session TTL must be at least {MIN_SESSION_TTL_SECS}s, got {ttl_secs}"),
            });
        }

        let grant = match with_timeout("lease grant", op_timeout, store.lease_grant(ttl_secs)).await {
            Ok(grant) => grant,
            Err(CoordinationError::Store { source }) => return Err(CoordinationError::SessionCreation { source }),
            Err(CoordinationError::Timeout { duration_ms, .. }) => {
                return Err(CoordinationError::SessionCreation {
                    source: StoreError::Timeout { duration_ms },
                });
            }
            Err(other) => return Err(other),
        };

        let cancel = parent.child_token();
        let expired = CancellationToken::new();
        tokio::spawn(run_keepalive_loop(
            store.clone(),
            grant.id,
            keepalive_interval(grant.ttl_secs),
            cancel.clone(),
            expired.clone(),
        ));

        info!(lease_id = grant.id, ttl_secs = grant.ttl_secs, "session created");
        Ok(Self {
            store,
            lease_id: grant.id,
            ttl_secs: grant.ttl_secs,
            op_timeout,
            cancel,
            expired,
        })
    }

    /// Lease backing the session.
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// True once the store no longer knows the lease.
    pub fn is_expired(&self) -> bool {
        self.expired.is_cancelled()
    }

    /// Resolves when the lease is found expired.
    pub fn expired(&self) -> WaitForCancellationFuture<'_> {
        self.expired.cancelled()
    }

    /// Record a lease loss seen by an operation before the keep-alive noticed it.
    pub(crate) fn mark_expired(&self) {
        if !self.expired.is_cancelled() {
            warn!(lease_id = self.lease_id, "session lease lost");
        }
        self.expired.cancel();
        self.cancel.cancel();
    }

    /// Stop refreshing and revoke the lease, deleting every key written under it.
    pub async fn close(&self) -> Result<(), CoordinationError> {
        self.cancel.cancel();
        if self.is_expired() {
            return Ok(());
        }
        match with_timeout("lease revoke", self.op_timeout, self.store.lease_revoke(self.lease_id)).await {
            Ok(()) | Err(CoordinationError::Store {
                source: StoreError::LeaseNotFound { .. },
            }) => {
                self.expired.cancel();
                debug!(lease_id = self.lease_id, "session closed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl<S: CoordinationStore + ?Sized + 'static> Drop for Session<S> {
    fn drop(&mut self) {
        // The lease is left to expire on its own.
        self.cancel.cancel();
    }
}

pub(crate) fn keepalive_interval(ttl_secs: i64) -> Duration {
    let ttl_ms = u64::try_from(ttl_secs).unwrap_or(1).saturating_mul(1_000);
    Duration::from_millis((ttl_ms / 3).max(100))
}

async fn run_keepalive_loop<S: CoordinationStore + ?Sized + 'static>(
    store: Arc<S>,
    lease_id: LeaseId,
    interval: Duration,
    cancel: CancellationToken,
    expired: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately and the lease is fresh.
    ticker.tick().await;

    debug!(lease_id, interval_ms = interval.as_millis() as u64, "session keepalive started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(lease_id, "session keepalive stopped");
                break;
            }
            _ = ticker.tick() => {
                match store.lease_keep_alive_once(lease_id).await {
                    Ok(grant) => {
                        debug!(lease_id, ttl_secs = grant.ttl_secs, "session keepalive succeeded");
                    }
                    Err(StoreError::LeaseNotFound { .. }) => {
                        warn!(lease_id, "session lease expired");
                        expired.cancel();
                        break;
                    }
                    Err(e) => {
                        // The lease may still be valid; keep trying until it is reported gone.
                        warn!(lease_id, error = %e, "session keepalive failed");
                    }
                }
            }
        }
    }
}
