//! Keyed mutual exclusion scoped to a session.
//!
//! Each waiter writes `/lock/<key>/<lease-hex>` under its session lease. The
//! waiter whose key has the lowest create revision holds the lock; every other
//! waiter watches the waiter created just before it and re-checks when that key
//! is deleted. A crashed holder's key disappears with its lease.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use corral_core::Compare;
use corral_core::CompareOp;
use corral_core::CoordinationStore;
use corral_core::DeleteRequest;
use corral_core::EventType;
use corral_core::PutRequest;
use corral_core::RangeRequest;
use corral_core::Revision;
use corral_core::SortOrder;
use corral_core::SortTarget;
use corral_core::TxnOp;
use corral_core::TxnRequest;
use corral_core::WatchRequest;
use futures::StreamExt;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::CoordinationError;
use crate::pure::keys;
use crate::retry::with_timeout;
use crate::session::Session;

/// A named mutex bound to one session.
///
/// Within a process, callers of the same `SessionMutex` are serialized by a
/// local gate before they contend through the store.
pub struct SessionMutex<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    session: Session<S>,
    key: String,
    prefix: String,
    waiter_key: String,
    op_timeout: Duration,
    gate: Arc<tokio::sync::Mutex<()>>,
    held: parking_lot::Mutex<Option<OwnedMutexGuard<()>>>,
}

impl<S: CoordinationStore + ?Sized + 'static> SessionMutex<S> {
    /// Bind a mutex on `key` to `session`.
    pub fn new(store: Arc<S>, session: Session<S>, key: impl Into<String>, op_timeout: Duration) -> Self {
        let key = key.into();
        let prefix = keys::lock_prefix(&key);
        let waiter_key = keys::lock_waiter_key(&key, session.lease_id());
        Self {
            store,
            session,
            key,
            prefix,
            waiter_key,
            op_timeout,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            held: parking_lot::Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store key this session waits on.
    pub fn waiter_key(&self) -> &str {
        &self.waiter_key
    }

    pub fn session(&self) -> &Session<S> {
        &self.session
    }

    /// True while this process holds the lock.
    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Acquire the lock, waiting until it is granted or `cancel` fires.
    ///
    /// With a `timeout` the wait fails with [`CoordinationError::Timeout`]. On any
    /// failure the waiter key is removed so later waiters are not blocked. Once the
    /// session lease is gone every call fails with
    /// [`CoordinationError::SessionExpired`] and the local hold is dropped.
    pub async fn lock(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<(), CoordinationError> {
        // A hold whose waiter key vanished was lost with the lease.
        if self.is_held() && !self.waiter_exists().await? {
            self.forget_lost_session();
            return Err(CoordinationError::SessionExpired {
                lease_id: self.session.lease_id(),
            });
        }

        // Set once the local gate is passed and the waiter key may exist.
        let entered = AtomicBool::new(false);
        let attempt = async {
            let guard = self.gate.clone().lock_owned().await;
            entered.store(true, Ordering::Release);
            self.acquire().await?;
            Ok::<_, CoordinationError>(guard)
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(CoordinationError::Cancelled {
                operation: format!("lock '{}'", self.key),
            }),
            _ = self.session.expired() => Err(CoordinationError::SessionExpired {
                lease_id: self.session.lease_id(),
            }),
            result = bounded(attempt, timeout, &self.key) => result,
        };

        match outcome {
            Ok(guard) => {
                *self.held.lock() = Some(guard);
                info!(key = %self.key, waiter = %self.waiter_key, "lock acquired");
                Ok(())
            }
            Err(err) => {
                debug!(key = %self.key, error = %err, "lock attempt failed");
                if err.is_lease_lost() {
                    self.forget_lost_session();
                    return Err(err);
                }
                if entered.load(Ordering::Acquire)
                    && let Err(cleanup) = self.delete_waiter().await
                {
                    warn!(key = %self.key, error = %cleanup, "failed to remove lock waiter");
                }
                Err(err)
            }
        }
    }

    /// Release the lock by deleting the waiter key.
    pub async fn unlock(&self) -> Result<(), CoordinationError> {
        self.delete_waiter().await?;
        if self.held.lock().take().is_some() {
            info!(key = %self.key, "lock released");
        }
        Ok(())
    }

    fn forget_lost_session(&self) {
        self.session.mark_expired();
        if self.held.lock().take().is_some() {
            warn!(key = %self.key, "lock lost with its session");
        }
    }

    async fn waiter_exists(&self) -> Result<bool, CoordinationError> {
        let request = RangeRequest::key(self.waiter_key.clone()).count_only();
        let found = with_timeout("lock check", self.op_timeout, self.store.range(request)).await?;
        Ok(found.count > 0)
    }

    async fn delete_waiter(&self) -> Result<(), CoordinationError> {
        with_timeout("lock release", self.op_timeout, self.store.delete(DeleteRequest::key(self.waiter_key.clone())))
            .await?;
        Ok(())
    }

    async fn acquire(&self) -> Result<(), CoordinationError> {
        let lease = self.session.lease_id();
        let oldest = RangeRequest::prefix(self.prefix.clone())
            .sorted_by(SortTarget::CreateRevision, SortOrder::Ascend)
            .with_limit(1);
        let request = TxnRequest::new()
            .when(vec![Compare::create_revision(self.waiter_key.clone(), CompareOp::Equal, 0)])
            .and_then(vec![
                TxnOp::Put(PutRequest::new(self.waiter_key.clone(), "").with_lease(lease)),
                TxnOp::Range(oldest.clone()),
            ])
            .or_else(vec![TxnOp::Range(RangeRequest::key(self.waiter_key.clone()))]);

        let response = with_timeout("lock enqueue", self.op_timeout, self.store.txn(request)).await?;
        let my_revision = if response.succeeded {
            response.revision
        } else {
            match response.first_range().and_then(|range| range.kvs.first()) {
                Some(kv) => kv.create_revision,
                None => {
                    return Err(CoordinationError::SessionExpired { lease_id: lease });
                }
            }
        };

        let owner = if response.succeeded {
            response.first_range().and_then(|range| range.kvs.first()).map(|kv| kv.create_revision)
        } else {
            with_timeout("lock owner", self.op_timeout, self.store.range(oldest))
                .await?
                .kvs
                .first()
                .map(|kv| kv.create_revision)
        };

        if owner.is_some_and(|rev| rev != my_revision) {
            debug!(key = %self.key, my_revision, "lock contended, waiting");
            wait_for_predecessors(self.store.as_ref(), &self.prefix, my_revision, self.op_timeout).await?;
        }

        // The waiter key vanishes if the lease expired while waiting.
        let verify = RangeRequest::key(self.waiter_key.clone());
        let mine = with_timeout("lock verify", self.op_timeout, self.store.range(verify)).await?;
        if mine.kvs.is_empty() {
            return Err(CoordinationError::SessionExpired { lease_id: lease });
        }
        Ok(())
    }
}

async fn bounded<T, F>(attempt: F, timeout: Option<Duration>, key: &str) -> Result<T, CoordinationError>
where
    F: std::future::Future<Output = Result<T, CoordinationError>>,
{
    match timeout {
        None => attempt.await,
        Some(limit) => tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
            Err(CoordinationError::Timeout {
                operation: format!("lock '{key}'"),
                duration_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })
        }),
    }
}

/// Wait until no key under `prefix` was created before `revision`.
///
/// Watches only the newest older key at a time, so a release wakes exactly one
/// waiter.
pub(crate) async fn wait_for_predecessors<S: CoordinationStore + ?Sized>(
    store: &S,
    prefix: &str,
    revision: Revision,
    op_timeout: Duration,
) -> Result<(), CoordinationError> {
    loop {
        let waiters = with_timeout(
            "wait predecessors",
            op_timeout,
            store.range(RangeRequest::prefix(prefix).sorted_by(SortTarget::CreateRevision, SortOrder::Ascend)),
        )
        .await?;
        let Some(predecessor) = waiters.kvs.iter().rev().find(|kv| kv.create_revision < revision) else {
            return Ok(());
        };

        debug!(predecessor = %predecessor.key, "waiting for predecessor to be deleted");
        let request = WatchRequest::key(predecessor.key.clone()).with_start_revision(waiters.revision + 1);
        let mut events = with_timeout("watch predecessor", op_timeout, store.watch(request)).await?;
        while let Some(batch) = events.next().await {
            let batch = batch?;
            if batch.events.iter().any(|event| event.event_type == EventType::Delete) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use corral_testing::DeterministicCoordinationStore;

    use super::*;

    const OP_TIMEOUT: Duration = Duration::from_secs(1);

    async fn mutex(
        store: &Arc<DeterministicCoordinationStore>,
        key: &str,
        root: &CancellationToken,
    ) -> SessionMutex<DeterministicCoordinationStore> {
        let session = Session::new(store.clone(), 30, OP_TIMEOUT, root).await.unwrap();
        SessionMutex::new(store.clone(), session, key, OP_TIMEOUT)
    }

    #[tokio::test]
    async fn uncontended_lock_is_granted() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let lock = mutex(&store, "jobs", &root).await;

        lock.lock(None, &root).await.unwrap();
        assert!(lock.is_held());
        assert!(lock.waiter_key().starts_with("/lock/jobs/"));

        lock.unlock().await.unwrap();
        assert!(!lock.is_held());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn second_session_waits_for_release() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let first = mutex(&store, "jobs", &root).await;
        let second = Arc::new(mutex(&store, "jobs", &root).await);

        first.lock(None, &root).await.unwrap();

        let waiter = second.clone();
        let waiter_root = root.clone();
        let pending = tokio::spawn(async move { waiter.lock(None, &waiter_root).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        first.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap().unwrap();
        assert!(second.is_held());
    }

    #[tokio::test]
    async fn same_mutex_callers_queue_locally() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let shared = Arc::new(mutex(&store, "jobs", &root).await);
        shared.lock(None, &root).await.unwrap();

        let second = shared.clone();
        let second_root = root.clone();
        let pending = tokio::spawn(async move { second.lock(None, &second_root).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());
        assert_eq!(store.keys(), vec![shared.waiter_key().to_string()]);

        shared.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap().unwrap();
        assert!(shared.is_held());
    }

    #[tokio::test]
    async fn timed_out_wait_removes_waiter() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let holder = mutex(&store, "jobs", &root).await;
        let impatient = mutex(&store, "jobs", &root).await;

        holder.lock(None, &root).await.unwrap();
        let result = impatient.lock(Some(Duration::from_millis(100)), &root).await;

        assert!(matches!(result, Err(CoordinationError::Timeout { .. })));
        assert_eq!(store.keys(), vec![holder.waiter_key().to_string()]);
    }

    #[tokio::test]
    async fn cancellation_aborts_wait() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let holder = mutex(&store, "jobs", &root).await;
        let waiter = mutex(&store, "jobs", &root).await;
        holder.lock(None, &root).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = waiter.lock(None, &cancel).await;
        assert!(matches!(result, Err(CoordinationError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn expired_holder_releases_lock() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let holder = mutex(&store, "jobs", &root).await;
        let next = mutex(&store, "jobs", &root).await;
        holder.lock(None, &root).await.unwrap();

        store.expire_lease(holder.session().lease_id());

        next.lock(Some(Duration::from_secs(2)), &root).await.unwrap();
        assert!(next.is_held());
    }

    #[tokio::test]
    async fn lost_session_fails_fast_and_drops_hold() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let lock = mutex(&store, "jobs", &root).await;
        lock.lock(None, &root).await.unwrap();

        assert!(store.expire_lease(lock.session().lease_id()));

        let result = lock.lock(Some(Duration::from_secs(2)), &root).await;
        assert!(matches!(result, Err(CoordinationError::SessionExpired { .. })));
        assert!(!lock.is_held());
        assert!(lock.session().is_expired());
        let again = lock.lock(Some(Duration::from_secs(2)), &root).await;
        assert!(again.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let a = mutex(&store, "a", &root).await;
        let b = mutex(&store, "b", &root).await;

        a.lock(None, &root).await.unwrap();
        b.lock(Some(Duration::from_millis(500)), &root).await.unwrap();
        assert!(a.is_held() && b.is_held());
    }
}
