//! Service registration kept alive by a lease.
//!
//! A provider writes one key under its own lease and refreshes the lease in the
//! background. When a refresh fails the subscriber is told, and the key is
//! written again under a fresh lease on the next registration tick.

use std::sync::Arc;
use std::time::Duration;

use corral_core::CoordinationStore;
use corral_core::LeaseId;
use corral_core::PutRequest;
use corral_core::constants::MIN_SESSION_TTL_SECS;
use corral_core::constants::PROVIDER_REGISTER_INTERVAL_MS;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::CoordinationError;
use crate::notify::Notifier;
use crate::retry::with_timeout;
use crate::session::keepalive_interval;

/// Registration status reported to a provider's subscriber.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The key was written under `lease_id`.
    Registered { lease_id: LeaseId },
    /// Registration or refresh failed; a new registration follows.
    Disconnected { error: CoordinationError },
}

pub(crate) struct ProviderParams {
    pub key: String,
    pub value: String,
    pub ttl_secs: i64,
    pub op_timeout: Duration,
}

/// Handle to a running provider.
pub struct ProviderHandle {
    key: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ProviderHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop refreshing and revoke the registration lease.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(key = %self.key, error = %e, "provider task failed");
        }
    }
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn<S: CoordinationStore + ?Sized + 'static>(
    store: Arc<S>,
    params: ProviderParams,
    notifier: Notifier<ProviderEvent>,
    parent: &CancellationToken,
) -> Result<ProviderHandle, CoordinationError> {
    if params.key.is_empty() {
        return Err(CoordinationError::InvalidParam {
            reason: "provider key must not be empty".to_string(),
        });
    }
    if params.ttl_secs < MIN_SESSION_TTL_SECS {
        return Err(CoordinationError::InvalidParam {
            reason: format!("provider TTL must be at least {MIN_SESSION_TTL_SECS}s, got {}", params.ttl_secs),
        });
    }

    let cancel = parent.child_token();
    let key = params.key.clone();
    let task = tokio::spawn(run_provider_loop(store, params, notifier, cancel.clone()));
    info!(key = %key, "provider started");

    Ok(ProviderHandle {
        key,
        cancel,
        task: Some(task),
    })
}

async fn run_provider_loop<S: CoordinationStore + ?Sized + 'static>(
    store: Arc<S>,
    params: ProviderParams,
    notifier: Notifier<ProviderEvent>,
    cancel: CancellationToken,
) {
    let refresh_every = keepalive_interval(params.ttl_secs);
    let tick_every = refresh_every.min(Duration::from_millis(PROVIDER_REGISTER_INTERVAL_MS));
    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Lease and time of its last refresh.
    let mut lease: Option<(LeaseId, Instant)> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let event = match lease {
            None => match register(store.as_ref(), &params).await {
                Ok(lease_id) => {
                    info!(key = %params.key, lease_id, "provider registered");
                    lease = Some((lease_id, Instant::now()));
                    ProviderEvent::Registered { lease_id }
                }
                Err(error) => {
                    warn!(key = %params.key, error = %error, "provider registration failed");
                    ProviderEvent::Disconnected { error }
                }
            },
            Some((lease_id, refreshed)) if refreshed.elapsed() >= refresh_every => {
                match with_timeout("lease keepalive", params.op_timeout, store.lease_keep_alive_once(lease_id)).await {
                    Ok(_) => {
                        debug!(key = %params.key, lease_id, "provider lease refreshed");
                        lease = Some((lease_id, Instant::now()));
                        continue;
                    }
                    Err(error) => {
                        warn!(key = %params.key, lease_id, error = %error, "provider lease refresh failed");
                        lease = None;
                        ProviderEvent::Disconnected { error }
                    }
                }
            }
            Some(_) => continue,
        };

        if !notifier.notify(event).await {
            break;
        }
    }

    if let Some((lease_id, _)) = lease {
        match with_timeout("lease revoke", params.op_timeout, store.lease_revoke(lease_id)).await {
            Ok(()) => debug!(key = %params.key, lease_id, "provider lease revoked"),
            Err(e) => warn!(key = %params.key, lease_id, error = %e, "failed to revoke provider lease"),
        }
    }
    info!(key = %params.key, "provider stopped");
}

/// Grant a lease and write the key under it.
async fn register<S: CoordinationStore + ?Sized>(
    store: &S,
    params: &ProviderParams,
) -> Result<LeaseId, CoordinationError> {
    let grant = with_timeout("lease grant", params.op_timeout, store.lease_grant(params.ttl_secs)).await?;
    let put = PutRequest::new(&params.key, &params.value).with_lease(grant.id);
    if let Err(e) = with_timeout("provider put", params.op_timeout, store.put(put)).await {
        // An unrevoked lease still expires after its TTL.
        if let Err(revoke) = with_timeout("lease revoke", params.op_timeout, store.lease_revoke(grant.id)).await {
            debug!(key = %params.key, lease_id = grant.id, error = %revoke, "failed to revoke unused provider lease");
        }
        return Err(e);
    }
    Ok(grant.id)
}

#[cfg(test)]
mod tests {
    use corral_core::RangeRequest;
    use corral_testing::DeterministicCoordinationStore;
    use tokio::sync::mpsc;

    use super::*;

    fn params(key: &str) -> ProviderParams {
        ProviderParams {
            key: key.to_string(),
            value: "10.0.0.1:8080".to_string(),
            ttl_secs: 3,
            op_timeout: Duration::from_secs(1),
        }
    }

    async fn next(rx: &mut mpsc::Receiver<ProviderEvent>) -> ProviderEvent {
        tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn registers_key_under_lease() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn(store.clone(), params("/services/api/a"), Notifier::Channel(tx), &root).unwrap();

        let ProviderEvent::Registered { lease_id } = next(&mut rx).await else {
            panic!("expected registration");
        };
        let read = store.range(RangeRequest::key("/services/api/a")).await.unwrap();
        assert_eq!(read.kvs[0].value, "10.0.0.1:8080");
        assert_eq!(read.kvs[0].lease, lease_id);

        handle.stop().await;
        assert!(store.keys().is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn lost_lease_is_reported_and_re_registered() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn(store.clone(), params("/services/api/b"), Notifier::Channel(tx), &root).unwrap();

        let ProviderEvent::Registered { lease_id: first } = next(&mut rx).await else {
            panic!("expected registration");
        };
        store.expire_lease(first);
        assert!(store.keys().is_empty());

        assert!(matches!(next(&mut rx).await, ProviderEvent::Disconnected { .. }));
        let ProviderEvent::Registered { lease_id: second } = next(&mut rx).await else {
            panic!("expected re-registration");
        };
        assert_ne!(first, second);
        assert_eq!(store.keys(), vec!["/services/api/b".to_string()]);

        handle.stop().await;
    }

    #[tokio::test]
    async fn failed_registration_is_retried() {
        let store = DeterministicCoordinationStore::new();
        store.fail_next_writes(1);
        let root = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn(store.clone(), params("/services/api/c"), Notifier::Channel(tx), &root).unwrap();

        assert!(matches!(next(&mut rx).await, ProviderEvent::Disconnected { .. }));
        assert!(matches!(next(&mut rx).await, ProviderEvent::Registered { .. }));

        handle.stop().await;
    }

    #[tokio::test]
    async fn failed_put_revokes_its_lease() {
        let store = DeterministicCoordinationStore::new();
        store.fail_next_puts(1);

        let result = register(store.as_ref(), &params("/services/api/d")).await;

        assert!(matches!(result, Err(CoordinationError::Store { .. })));
        assert_eq!(store.lease_count(), 0);
        assert!(store.keys().is_empty());
        assert!(register(store.as_ref(), &params("/services/api/d")).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_bad_parameters() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);

        let mut zero_ttl = params("/services/x");
        zero_ttl.ttl_secs = 0;
        assert!(matches!(
            spawn(store.clone(), zero_ttl, Notifier::Channel(tx.clone()), &root),
            Err(CoordinationError::InvalidParam { .. })
        ));
        assert!(matches!(
            spawn(store, params(""), Notifier::Channel(tx), &root),
            Err(CoordinationError::InvalidParam { .. })
        ));
    }
}
