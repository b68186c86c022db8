//! Entry point owning the store handle and every primitive created through it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use corral_core::Compare;
use corral_core::CompareOp;
use corral_core::CoordinationStore;
use corral_core::DeleteRequest;
use corral_core::KeyValue;
use corral_core::LeaseGrant;
use corral_core::LeaseId;
use corral_core::LeaseTimeToLive;
use corral_core::PutRequest;
use corral_core::RangeRequest;
use corral_core::Revision;
use corral_core::SortOrder;
use corral_core::SortTarget;
use corral_core::TxnOp;
use corral_core::TxnRequest;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::CoordinationConfig;
use crate::election;
use crate::election::ElectionHandle;
use crate::election::ElectionParams;
use crate::election::ElectionState;
use crate::election::LeadershipEvent;
use crate::error::CoordinationError;
use crate::lock::SessionMutex;
use crate::notify::Notifier;
use crate::provider;
use crate::provider::ProviderEvent;
use crate::provider::ProviderHandle;
use crate::provider::ProviderParams;
use crate::pure::keys;
use crate::queue;
use crate::queue::PriorityQueue;
use crate::retry::WriteRetry;
use crate::retry::with_timeout;
use crate::session::Session;
use crate::watcher;
use crate::watcher::WatchNotification;
use crate::watcher::WatcherHandle;
use crate::watcher::WatcherParams;

/// Identifier of an election, watcher or provider registered with a client.
pub type HandleId = u64;

/// Coordination client over one store.
///
/// Locks are tracked by key, one session each. Elections, watchers and
/// providers are tracked by the [`HandleId`] returned when they are created.
/// [`close`](Self::close) stops every background task and revokes every lease
/// the client still holds; dropping the client only stops the tasks.
pub struct CoordinationClient<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    config: CoordinationConfig,
    node_name: String,
    retry: WriteRetry,
    cancel: CancellationToken,
    next_id: AtomicU64,
    locks: Mutex<HashMap<String, Arc<SessionMutex<S>>>>,
    elections: Mutex<HashMap<HandleId, Arc<ElectionHandle<S>>>>,
    watchers: Mutex<HashMap<HandleId, WatcherHandle>>,
    providers: Mutex<HashMap<HandleId, ProviderHandle>>,
}

impl<S: CoordinationStore + ?Sized + 'static> CoordinationClient<S> {
    /// Create a client. The configuration is validated first.
    pub fn new(store: Arc<S>, config: CoordinationConfig) -> Result<Self, CoordinationError> {
        config.validate().map_err(|e| CoordinationError::InvalidParam { reason: e.to_string() })?;

        info!(node = %config.node_name, "coordination client created");
        Ok(Self {
            store,
            node_name: config.node_name.clone(),
            retry: WriteRetry::new(config.write_retry_attempts, config.write_retry_delay()),
            config,
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            locks: Mutex::new(HashMap::new()),
            elections: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the node identity used by elections created afterwards.
    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn op_timeout(&self) -> Duration {
        self.config.operation_timeout()
    }

    fn next_handle_id(&self) -> HandleId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Key-value helpers
    // ------------------------------------------------------------------

    /// Write `key`, retrying transient failures.
    pub async fn put(&self, key: &str, value: &str) -> Result<Revision, CoordinationError> {
        require_non_empty("key", key)?;
        let result = self
            .retry
            .run("put", || with_timeout("put", self.op_timeout(), self.store.put(PutRequest::new(key, value))))
            .await?;
        Ok(result.revision)
    }

    /// Write `key` under a new lease of `ttl_secs`. Returns the lease.
    pub async fn put_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> Result<LeaseId, CoordinationError> {
        let lease = self.create_lease(ttl_secs).await?;
        self.put_with_lease(key, value, lease.id).await?;
        Ok(lease.id)
    }

    /// Write `key` attached to an existing lease.
    pub async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<Revision, CoordinationError> {
        require_non_empty("key", key)?;
        require_lease(lease)?;
        let result = self
            .retry
            .run("put with lease", || {
                let request = PutRequest::new(key, value).with_lease(lease);
                with_timeout("put with lease", self.op_timeout(), self.store.put(request))
            })
            .await?;
        Ok(result.revision)
    }

    /// Values of every key under `prefix`, in key order.
    pub async fn get(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        Ok(self.range(RangeRequest::prefix(prefix)).await?.into_iter().map(|kv| kv.value).collect())
    }

    /// Value of exactly `key`.
    pub async fn get_one(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        require_non_empty("key", key)?;
        Ok(self.range(RangeRequest::key(key)).await?.into_iter().next().map(|kv| kv.value))
    }

    /// Key to value map of everything under `prefix`.
    pub async fn get_kvs(&self, prefix: &str) -> Result<BTreeMap<String, String>, CoordinationError> {
        Ok(self.range(RangeRequest::prefix(prefix)).await?.into_iter().map(|kv| (kv.key, kv.value)).collect())
    }

    /// Keys under `prefix`, in key order.
    pub async fn get_keys(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        Ok(self.range(RangeRequest::prefix(prefix)).await?.into_iter().map(|kv| kv.key).collect())
    }

    /// At most `limit` entries under `prefix`, in key order.
    pub async fn get_limit(&self, prefix: &str, limit: u32) -> Result<Vec<KeyValue>, CoordinationError> {
        self.range(RangeRequest::prefix(prefix).with_limit(limit)).await
    }

    /// Remove and return up to `limit` entries under `prefix`.
    ///
    /// Each entry is deleted only if unchanged since it was read, so
    /// concurrent callers never both receive the same entry.
    pub async fn pop_prefix(&self, prefix: &str, limit: u32) -> Result<Vec<KeyValue>, CoordinationError> {
        require_non_empty("prefix", prefix)?;
        let candidates = self.get_limit(prefix, limit).await?;

        let mut popped = Vec::with_capacity(candidates.len());
        for kv in candidates {
            let txn = TxnRequest::new()
                .when(vec![Compare::mod_revision(&kv.key, CompareOp::Equal, kv.mod_revision)])
                .and_then(vec![TxnOp::Delete(DeleteRequest::key(&kv.key))]);
            if with_timeout("pop prefix", self.op_timeout(), self.store.txn(txn)).await?.succeeded {
                popped.push(kv);
            }
        }
        Ok(popped)
    }

    /// Delete `key`. Returns the number of keys removed.
    pub async fn delete(&self, key: &str) -> Result<u64, CoordinationError> {
        require_non_empty("key", key)?;
        let result = self
            .retry
            .run("delete", || with_timeout("delete", self.op_timeout(), self.store.delete(DeleteRequest::key(key))))
            .await?;
        Ok(result.deleted)
    }

    /// Delete every key under `prefix`.
    pub async fn delete_with_prefix(&self, prefix: &str) -> Result<u64, CoordinationError> {
        require_non_empty("prefix", prefix)?;
        let result = self
            .retry
            .run("delete prefix", || {
                with_timeout("delete prefix", self.op_timeout(), self.store.delete(DeleteRequest::prefix(prefix)))
            })
            .await?;
        Ok(result.deleted)
    }

    /// Grant a lease of `ttl_secs`.
    pub async fn create_lease(&self, ttl_secs: i64) -> Result<LeaseGrant, CoordinationError> {
        if ttl_secs <= 0 {
            return Err(CoordinationError::InvalidParam {
                reason: format!("lease TTL must be positive, got {ttl_secs}"),
            });
        }
        self.retry
            .run("lease grant", || with_timeout("lease grant", self.op_timeout(), self.store.lease_grant(ttl_secs)))
            .await
    }

    /// Refresh `lease` once.
    pub async fn keep_alive_once(&self, lease: LeaseId) -> Result<LeaseGrant, CoordinationError> {
        require_lease(lease)?;
        with_timeout("lease keepalive", self.op_timeout(), self.store.lease_keep_alive_once(lease)).await
    }

    /// Remaining and granted TTL of `lease`.
    pub async fn lease_ttl(&self, lease: LeaseId) -> Result<LeaseTimeToLive, CoordinationError> {
        require_lease(lease)?;
        with_timeout("lease ttl", self.op_timeout(), self.store.lease_time_to_live(lease)).await
    }

    async fn range(&self, request: RangeRequest) -> Result<Vec<KeyValue>, CoordinationError> {
        Ok(with_timeout("range", self.op_timeout(), self.store.range(request)).await?.kvs)
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Acquire the lock on `key`, waiting as long as it takes.
    #[instrument(skip(self))]
    pub async fn lock(&self, key: &str) -> Result<(), CoordinationError> {
        self.lock_within(key, None).await
    }

    /// Acquire the lock on `key`, giving up after `timeout`.
    #[instrument(skip(self))]
    pub async fn lock_timeout(&self, key: &str, timeout: Duration) -> Result<(), CoordinationError> {
        self.lock_within(key, Some(timeout)).await
    }

    /// Lock through the cached mutex, renewing its session once if the lease is gone.
    async fn lock_within(&self, key: &str, timeout: Option<Duration>) -> Result<(), CoordinationError> {
        let deadline = timeout.map(|limit| tokio::time::Instant::now() + limit);
        let mutex = self.session_mutex(key).await?;
        match mutex.lock(timeout, &self.cancel).await {
            Err(err) if err.is_lease_lost() => {
                info!(key, lease_id = mutex.session().lease_id(), "lock session lost, renewing");
                let remaining = deadline.map(|at| at.saturating_duration_since(tokio::time::Instant::now()));
                self.session_mutex(key).await?.lock(remaining, &self.cancel).await
            }
            other => other,
        }
    }

    /// Release the lock on `key`.
    pub async fn unlock(&self, key: &str) -> Result<(), CoordinationError> {
        let mutex = self.locks.lock().get(key).cloned();
        match mutex {
            Some(mutex) => mutex.unlock().await,
            None => Err(CoordinationError::LockNotFound { key: key.to_string() }),
        }
    }

    /// Forget the lock on `key` and close its session.
    ///
    /// Revoking the session lease releases the lock if it is held. Unknown
    /// keys are ignored.
    pub async fn destroy_lock(&self, key: &str) -> Result<(), CoordinationError> {
        let mutex = self.locks.lock().remove(key);
        let Some(mutex) = mutex else {
            debug!(key, "destroy of unknown lock ignored");
            return Ok(());
        };
        mutex.session().close().await?;
        info!(key, "lock destroyed");
        Ok(())
    }

    /// The mutex for `key`, creating its session on first use.
    ///
    /// A cached mutex whose session expired is replaced by one on a new session.
    async fn session_mutex(&self, key: &str) -> Result<Arc<SessionMutex<S>>, CoordinationError> {
        require_non_empty("lock key", key)?;
        if let Some(mutex) = self.locks.lock().get(key).cloned()
            && !mutex.session().is_expired()
        {
            return Ok(mutex);
        }

        let ttl = self.config.session_ttl_secs;
        let session = Session::new(self.store.clone(), ttl, self.op_timeout(), &self.cancel).await?;
        let created = Arc::new(SessionMutex::new(self.store.clone(), session, key, self.op_timeout()));

        let (mutex, lost_race) = match self.locks.lock().entry(key.to_string()) {
            Entry::Occupied(mut existing) if existing.get().session().is_expired() => {
                existing.insert(created.clone());
                (created, None)
            }
            Entry::Occupied(existing) => (existing.get().clone(), Some(created)),
            Entry::Vacant(slot) => (slot.insert(created).clone(), None),
        };
        if let Some(unused) = lost_race
            && let Err(e) = unused.session().close().await
        {
            warn!(key, error = %e, "failed to close unused lock session");
        }
        Ok(mutex)
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    /// Join the election on `key`, reporting every observation to `callback`.
    ///
    /// Callback invocations for one election never overlap.
    pub async fn new_election<F>(&self, key: &str, callback: F) -> Result<HandleId, CoordinationError>
    where F: Fn(LeadershipEvent) + Send + Sync + 'static {
        self.start_election(key, Notifier::Callback(Arc::new(callback))).await
    }

    /// Join the election on `key`, delivering observations through a channel.
    ///
    /// The election stops when the receiver is dropped.
    pub async fn subscribe_election(
        &self,
        key: &str,
    ) -> Result<(HandleId, mpsc::Receiver<LeadershipEvent>), CoordinationError> {
        let (tx, rx) = mpsc::channel(self.config.watcher.subscription_capacity);
        let id = self.start_election(key, Notifier::Channel(tx)).await?;
        Ok((id, rx))
    }

    async fn start_election(
        &self,
        key: &str,
        notifier: Notifier<LeadershipEvent>,
    ) -> Result<HandleId, CoordinationError> {
        let params = ElectionParams {
            key: key.to_string(),
            node_name: self.node_name.clone(),
            config: self.config.election.clone(),
            op_timeout: self.op_timeout(),
        };
        let handle = election::start(self.store.clone(), params, notifier, &self.cancel).await?;
        let id = self.next_handle_id();
        self.elections.lock().insert(id, Arc::new(handle));
        Ok(id)
    }

    /// Current state of election `id`.
    pub fn election_state(&self, id: HandleId) -> Option<ElectionState> {
        self.elections.lock().get(&id).map(|handle| handle.state())
    }

    /// State transitions of election `id`.
    pub fn watch_election_state(&self, id: HandleId) -> Option<watch::Receiver<ElectionState>> {
        self.elections.lock().get(&id).map(|handle| handle.subscribe_state())
    }

    /// Withdraw this node's candidacy in election `id`.
    pub async fn resign(&self, id: HandleId) -> Result<(), CoordinationError> {
        let handle = self.elections.lock().get(&id).cloned();
        match handle {
            Some(handle) => handle.resign().await,
            None => Err(unknown_handle("election", id)),
        }
    }

    /// Stop election `id` and close its session. Returns false for unknown ids.
    pub async fn destroy_election(&self, id: HandleId) -> bool {
        let handle = self.elections.lock().remove(&id);
        match handle {
            Some(handle) => {
                handle.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Value of the current leader of the election on `key`.
    pub async fn leader(&self, key: &str) -> Result<String, CoordinationError> {
        require_non_empty("election key", key)?;
        let request = RangeRequest::prefix(keys::election_prefix(key))
            .sorted_by(SortTarget::CreateRevision, SortOrder::Ascend)
            .with_limit(1);
        match self.range(request).await?.into_iter().next() {
            Some(kv) => Ok(kv.value),
            None => Err(CoordinationError::NoLeader { key: key.to_string() }),
        }
    }

    // ------------------------------------------------------------------
    // Watchers
    // ------------------------------------------------------------------

    /// Watch `prefix`, running `callback` for each notification on the
    /// watcher's worker pool.
    pub fn new_watcher<F>(&self, prefix: &str, callback: F) -> Result<HandleId, CoordinationError>
    where F: Fn(WatchNotification) + Send + Sync + 'static {
        self.start_watcher(prefix, Notifier::Callback(Arc::new(callback)))
    }

    /// Watch `prefix`, delivering notifications in order through a channel.
    ///
    /// The watcher stops when the receiver is dropped.
    pub fn subscribe(&self, prefix: &str) -> Result<(HandleId, mpsc::Receiver<WatchNotification>), CoordinationError> {
        let (tx, rx) = mpsc::channel(self.config.watcher.subscription_capacity);
        let id = self.start_watcher(prefix, Notifier::Channel(tx))?;
        Ok((id, rx))
    }

    fn start_watcher(
        &self,
        prefix: &str,
        notifier: Notifier<WatchNotification>,
    ) -> Result<HandleId, CoordinationError> {
        let params = WatcherParams {
            prefix: prefix.to_string(),
            config: self.config.watcher.clone(),
            op_timeout: self.op_timeout(),
        };
        let handle = watcher::spawn(self.store.clone(), params, notifier, &self.cancel)?;
        let id = self.next_handle_id();
        self.watchers.lock().insert(id, handle);
        Ok(id)
    }

    /// Stop watcher `id`. Returns false for unknown ids.
    pub async fn stop_watcher(&self, id: HandleId) -> bool {
        let handle = self.watchers.lock().remove(&id);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Priority queues
    // ------------------------------------------------------------------

    /// Handle on the priority queue `name`.
    pub fn priority_queue(&self, name: &str) -> Result<PriorityQueue<S>, CoordinationError> {
        PriorityQueue::new(
            self.store.clone(),
            name,
            self.config.queue.clone(),
            self.op_timeout(),
            self.retry,
            self.cancel.child_token(),
        )
    }

    /// Names of the queues registered under `namespace`.
    pub async fn priority_queue_list(&self, namespace: &str) -> Result<Vec<String>, CoordinationError> {
        queue::list_priority_queues(self.store.as_ref(), namespace, self.op_timeout()).await
    }

    // ------------------------------------------------------------------
    // Providers
    // ------------------------------------------------------------------

    /// Keep `key` registered with `value` under a lease of `ttl_secs`.
    pub fn new_provider<F>(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
        callback: F,
    ) -> Result<HandleId, CoordinationError>
    where
        F: Fn(ProviderEvent) + Send + Sync + 'static,
    {
        let params = ProviderParams {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs,
            op_timeout: self.op_timeout(),
        };
        let handle = provider::spawn(self.store.clone(), params, Notifier::Callback(Arc::new(callback)), &self.cancel)?;
        let id = self.next_handle_id();
        self.providers.lock().insert(id, handle);
        Ok(id)
    }

    /// Stop provider `id` and revoke its lease. Returns false for unknown ids.
    pub async fn stop_provider(&self, id: HandleId) -> bool {
        let handle = self.providers.lock().remove(&id);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop every background task and revoke every lease this client holds.
    pub async fn close(&self) {
        self.cancel.cancel();

        let elections: Vec<_> = self.elections.lock().drain().map(|(_, handle)| handle).collect();
        for handle in elections {
            handle.destroy().await;
        }
        let watchers: Vec<_> = self.watchers.lock().drain().map(|(_, handle)| handle).collect();
        for handle in watchers {
            handle.stop().await;
        }
        let providers: Vec<_> = self.providers.lock().drain().map(|(_, handle)| handle).collect();
        for handle in providers {
            handle.stop().await;
        }
        let locks: Vec<_> = self.locks.lock().drain().map(|(_, mutex)| mutex).collect();
        for mutex in locks {
            if let Err(e) = mutex.session().close().await {
                warn!(key = %mutex.key(), error = %e, "failed to close lock session");
            }
        }

        info!(node = %self.node_name, "coordination client closed");
    }
}

impl<S: CoordinationStore + ?Sized + 'static> Drop for CoordinationClient<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn require_non_empty(what: &str, value: &str) -> Result<(), CoordinationError> {
    if value.is_empty() {
        return Err(CoordinationError::InvalidParam {
            reason: format!("{what} must not be empty"),
        });
    }
    Ok(())
}

fn require_lease(lease: LeaseId) -> Result<(), CoordinationError> {
    if lease == 0 {
        return Err(CoordinationError::InvalidParam {
            reason: "lease id must not be zero".to_string(),
        });
    }
    Ok(())
}

fn unknown_handle(kind: &str, id: HandleId) -> CoordinationError {
    CoordinationError::InvalidParam {
        reason: format!("no {kind} with id {id}"),
    }
}
