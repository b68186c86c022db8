//! Deterministic in-memory implementation of [`CoordinationStore`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use corral_core::Compare;
use corral_core::CompareTarget;
use corral_core::CoordinationStore;
use corral_core::DeleteRequest;
use corral_core::DeleteResult;
use corral_core::EventType;
use corral_core::KeyValue;
use corral_core::LeaseGrant;
use corral_core::LeaseId;
use corral_core::LeaseTimeToLive;
use corral_core::PutRequest;
use corral_core::PutResult;
use corral_core::RangeRequest;
use corral_core::RangeResult;
use corral_core::Revision;
use corral_core::SortOrder;
use corral_core::SortTarget;
use corral_core::StoreError;
use corral_core::TxnOp;
use corral_core::TxnOpResult;
use corral_core::TxnRequest;
use corral_core::TxnResult;
use corral_core::WatchBatch;
use corral_core::WatchEvent;
use corral_core::WatchRequest;
use corral_core::WatchStream;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Number of revisions kept for watch replay.
const HISTORY_LIMIT: usize = 4_096;

/// How often the background reaper expires leases.
const LEASE_REAP_INTERVAL: Duration = Duration::from_millis(50);

/// First lease identifier handed out.
const FIRST_LEASE_ID: LeaseId = 0x1_0000;

struct LeaseState {
    ttl_secs: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct WatchSlot {
    key: String,
    is_prefix: bool,
    prev_kv: bool,
    tx: mpsc::UnboundedSender<Result<WatchBatch, StoreError>>,
}

impl WatchSlot {
    fn select(&self, events: &[WatchEvent]) -> Vec<WatchEvent> {
        events
            .iter()
            .filter(|event| key_matches(&event.kv.key, &self.key, self.is_prefix))
            .map(|event| WatchEvent {
                event_type: event.event_type,
                kv: event.kv.clone(),
                prev_kv: if self.prev_kv { event.prev_kv.clone() } else { None },
            })
            .collect()
    }
}

struct Inner {
    revision: Revision,
    data: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease_id: LeaseId,
    watchers: Vec<WatchSlot>,
    history: VecDeque<(Revision, Vec<WatchEvent>)>,
    compacted_revision: Revision,
    pending_failures: u32,
    pending_put_failures: u32,
}

fn key_matches(key: &str, pattern: &str, is_prefix: bool) -> bool {
    if is_prefix { key.starts_with(pattern) } else { key == pattern }
}

impl Inner {
    fn new() -> Self {
        Self {
            revision: 0,
            data: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease_id: FIRST_LEASE_ID,
            watchers: Vec::new(),
            history: VecDeque::new(),
            compacted_revision: 0,
            pending_failures: 0,
            pending_put_failures: 0,
        }
    }

    fn take_injected_failure(&mut self, operation: &str) -> Result<(), StoreError> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(StoreError::Connection {
                reason: format!("injected failure during {operation}"),
            });
        }
        Ok(())
    }

    fn expire_leases(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> =
            self.leases.iter().filter(|(_, lease)| lease.deadline <= now).map(|(id, _)| *id).collect();
        for lease_id in expired {
            debug!(lease_id, "lease expired");
            self.revoke(lease_id);
        }
    }

    fn revoke(&mut self, lease_id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&lease_id) else {
            return false;
        };
        let revision = self.revision + 1;
        let mut events = Vec::new();
        for key in lease.keys {
            if let Some(previous) = self.data.remove(&key) {
                events.push(delete_event(previous, revision));
            }
        }
        if !events.is_empty() {
            self.revision = revision;
            self.publish(revision, events);
        }
        true
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<(), StoreError> {
        match lease {
            Some(lease_id) if lease_id != 0 && !self.leases.contains_key(&lease_id) => {
                Err(StoreError::LeaseNotFound { lease_id })
            }
            _ => Ok(()),
        }
    }

    fn apply_put(&mut self, request: &PutRequest, revision: Revision) -> (PutResult, WatchEvent) {
        let previous = self.data.get(&request.key).cloned();
        let lease = request.lease.unwrap_or(0);
        let (create_revision, version) = match &previous {
            Some(kv) => (kv.create_revision, kv.version + 1),
            None => (revision, 1),
        };

        if let Some(old) = &previous {
            if old.lease != 0 && old.lease != lease {
                if let Some(state) = self.leases.get_mut(&old.lease) {
                    state.keys.remove(&request.key);
                }
            }
        }
        if lease != 0 {
            if let Some(state) = self.leases.get_mut(&lease) {
                state.keys.insert(request.key.clone());
            }
        }

        let kv = KeyValue {
            key: request.key.clone(),
            value: request.value.clone(),
            create_revision,
            mod_revision: revision,
            version,
            lease,
        };
        self.data.insert(request.key.clone(), kv.clone());

        let result = PutResult {
            revision,
            prev_kv: if request.prev_kv { previous.clone() } else { None },
        };
        let event = WatchEvent {
            event_type: EventType::Put,
            kv,
            prev_kv: previous,
        };
        (result, event)
    }

    fn apply_delete(&mut self, request: &DeleteRequest, revision: Revision) -> (DeleteResult, Vec<WatchEvent>) {
        let keys: Vec<String> = self
            .data
            .keys()
            .filter(|key| key_matches(key, &request.key, request.is_prefix))
            .cloned()
            .collect();

        let mut prev_kvs = Vec::new();
        let mut events = Vec::new();
        for key in keys {
            if let Some(previous) = self.data.remove(&key) {
                if previous.lease != 0 {
                    if let Some(state) = self.leases.get_mut(&previous.lease) {
                        state.keys.remove(&key);
                    }
                }
                if request.prev_kv {
                    prev_kvs.push(previous.clone());
                }
                events.push(delete_event(previous, revision));
            }
        }

        let result = DeleteResult {
            deleted: events.len() as u64,
            revision: if events.is_empty() { self.revision } else { revision },
            prev_kvs,
        };
        (result, events)
    }

    fn apply_range(&self, request: &RangeRequest, revision: Revision) -> RangeResult {
        let mut kvs: Vec<KeyValue> = self
            .data
            .values()
            .filter(|kv| key_matches(&kv.key, &request.key, request.is_prefix))
            .cloned()
            .collect();

        let order = match (request.sort_target, request.sort_order) {
            (SortTarget::Key, SortOrder::None) => SortOrder::None,
            (_, SortOrder::None) => SortOrder::Ascend,
            (_, order) => order,
        };
        if order != SortOrder::None {
            match request.sort_target {
                SortTarget::Key => kvs.sort_by(|a, b| a.key.cmp(&b.key)),
                SortTarget::CreateRevision => kvs.sort_by_key(|kv| kv.create_revision),
                SortTarget::ModRevision => kvs.sort_by_key(|kv| kv.mod_revision),
            }
            if order == SortOrder::Descend {
                kvs.reverse();
            }
        }

        let count = kvs.len() as u64;
        let mut more = false;
        if request.count_only {
            kvs.clear();
        } else if let Some(limit) = request.limit {
            let limit = limit as usize;
            if kvs.len() > limit {
                more = true;
                kvs.truncate(limit);
            }
        }

        RangeResult {
            kvs,
            more,
            count,
            revision,
        }
    }

    fn compare_holds(&self, compare: &Compare) -> bool {
        let current = self.data.get(&compare.key);
        match &compare.target {
            CompareTarget::CreateRevision(expected) => {
                compare.op.holds(&current.map_or(0, |kv| kv.create_revision), expected)
            }
            CompareTarget::ModRevision(expected) => {
                compare.op.holds(&current.map_or(0, |kv| kv.mod_revision), expected)
            }
            CompareTarget::Version(expected) => compare.op.holds(&current.map_or(0, |kv| kv.version), expected),
            CompareTarget::Value(expected) => match current {
                Some(kv) => compare.op.holds(kv.value.as_str(), expected.as_str()),
                None => false,
            },
        }
    }

    fn publish(&mut self, revision: Revision, events: Vec<WatchEvent>) {
        self.watchers.retain(|slot| {
            let selected = slot.select(&events);
            if selected.is_empty() {
                return !slot.tx.is_closed();
            }
            slot.tx
                .send(Ok(WatchBatch {
                    revision,
                    events: selected,
                }))
                .is_ok()
        });

        self.history.push_back((revision, events));
        while self.history.len() > HISTORY_LIMIT {
            if let Some((dropped, _)) = self.history.pop_front() {
                self.compacted_revision = dropped;
            }
        }
    }
}

fn delete_event(previous: KeyValue, revision: Revision) -> WatchEvent {
    WatchEvent {
        event_type: EventType::Delete,
        kv: KeyValue {
            key: previous.key.clone(),
            value: String::new(),
            create_revision: 0,
            mod_revision: revision,
            version: 0,
            lease: 0,
        },
        prev_kv: Some(previous),
    }
}

/// A deterministic in-memory coordination store for testing.
///
/// Implements etcd v3 semantics closely enough for the corral recipes: a single
/// global revision, leases that delete their keys on expiry, atomic transactions
/// and prefix watches with a bounded replay history.
///
/// Test hooks allow injecting transient failures, expiring leases early and
/// force-closing every open watch stream.
pub struct DeterministicCoordinationStore {
    inner: Mutex<Inner>,
}

impl DeterministicCoordinationStore {
    /// Create a new store wrapped in `Arc`.
    ///
    /// When called inside a Tokio runtime a background task expires leases as
    /// their deadlines pass; it exits once the store is dropped.
    pub fn new() -> Arc<Self> {
        let store = Arc::new(Self {
            inner: Mutex::new(Inner::new()),
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap_leases(Arc::downgrade(&store)));
        }
        store
    }

    /// Current store revision.
    pub fn current_revision(&self) -> Revision {
        self.inner.lock().revision
    }

    /// Fail the next `count` mutating calls with a transient connection error.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.lock().pending_failures = count;
    }

    /// Fail the next `count` plain puts; transactions and lease calls still succeed.
    pub fn fail_next_puts(&self, count: u32) {
        self.inner.lock().pending_put_failures = count;
    }

    /// End every open watch stream, as a server-side disconnect would.
    pub fn close_watch_streams(&self) {
        let mut inner = self.inner.lock();
        debug!(watchers = inner.watchers.len(), "closing watch streams");
        inner.watchers.clear();
    }

    /// Number of open watch streams.
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|slot| !slot.tx.is_closed());
        inner.watchers.len()
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.expire_leases();
        inner.leases.len()
    }

    /// Expire a lease immediately, as if its holder had stopped renewing it.
    pub fn expire_lease(&self, lease_id: LeaseId) -> bool {
        self.inner.lock().revoke(lease_id)
    }

    /// Snapshot of every stored key.
    pub fn keys(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.expire_leases();
        inner.data.keys().cloned().collect()
    }

    fn expire_now(&self) {
        self.inner.lock().expire_leases();
    }
}

async fn reap_leases(store: Weak<DeterministicCoordinationStore>) {
    loop {
        tokio::time::sleep(LEASE_REAP_INTERVAL).await;
        match store.upgrade() {
            Some(store) => store.expire_now(),
            None => break,
        }
    }
}

#[async_trait]
impl CoordinationStore for DeterministicCoordinationStore {
    async fn range(&self, request: RangeRequest) -> Result<RangeResult, StoreError> {
        let mut inner = self.inner.lock();
        inner.expire_leases();
        let revision = inner.revision;
        Ok(inner.apply_range(&request, revision))
    }

    async fn put(&self, request: PutRequest) -> Result<PutResult, StoreError> {
        let mut inner = self.inner.lock();
        inner.take_injected_failure("put")?;
        if inner.pending_put_failures > 0 {
            inner.pending_put_failures -= 1;
            return Err(StoreError::Connection {
                reason: "injected put failure".to_string(),
            });
        }
        inner.expire_leases();
        inner.check_lease(request.lease)?;

        let revision = inner.revision + 1;
        let (result, event) = inner.apply_put(&request, revision);
        inner.revision = revision;
        inner.publish(revision, vec![event]);
        Ok(result)
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, StoreError> {
        let mut inner = self.inner.lock();
        inner.take_injected_failure("delete")?;
        inner.expire_leases();

        let revision = inner.revision + 1;
        let (result, events) = inner.apply_delete(&request, revision);
        if !events.is_empty() {
            inner.revision = revision;
            inner.publish(revision, events);
        }
        Ok(result)
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResult, StoreError> {
        let mut inner = self.inner.lock();
        inner.take_injected_failure("txn")?;
        inner.expire_leases();

        let succeeded = request.compare.iter().all(|compare| inner.compare_holds(compare));
        let ops = if succeeded { &request.success } else { &request.failure };

        for op in ops {
            if let TxnOp::Put(put) = op {
                inner.check_lease(put.lease)?;
            }
        }

        let write_revision = inner.revision + 1;
        let mut wrote = false;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put(put) => {
                    let (result, event) = inner.apply_put(put, write_revision);
                    wrote = true;
                    events.push(event);
                    responses.push(TxnOpResult::Put(result));
                }
                TxnOp::Delete(delete) => {
                    let (mut result, deleted) = inner.apply_delete(delete, write_revision);
                    if !deleted.is_empty() {
                        wrote = true;
                        result.revision = write_revision;
                    }
                    events.extend(deleted);
                    responses.push(TxnOpResult::Delete(result));
                }
                TxnOp::Range(range) => {
                    let revision = if wrote { write_revision } else { inner.revision };
                    responses.push(TxnOpResult::Range(inner.apply_range(range, revision)));
                }
            }
        }

        if wrote {
            inner.revision = write_revision;
            inner.publish(write_revision, events);
        }

        Ok(TxnResult {
            succeeded,
            revision: inner.revision,
            responses,
        })
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrant, StoreError> {
        let mut inner = self.inner.lock();
        inner.take_injected_failure("lease grant")?;
        if ttl_secs <= 0 {
            return Err(StoreError::InvalidRequest {
                reason: format!("lease TTL must be positive, got {ttl_secs}"),
            });
        }

        let id = inner.next_lease_id;
        inner.next_lease_id += 1;
        inner.leases.insert(id, LeaseState {
            ttl_secs,
            deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
            keys: BTreeSet::new(),
        });
        Ok(LeaseGrant { id, ttl_secs })
    }

    async fn lease_keep_alive_once(&self, lease_id: LeaseId) -> Result<LeaseGrant, StoreError> {
        let mut inner = self.inner.lock();
        inner.expire_leases();
        let lease = inner.leases.get_mut(&lease_id).ok_or(StoreError::LeaseNotFound { lease_id })?;
        lease.deadline = Instant::now() + Duration::from_secs(lease.ttl_secs as u64);
        Ok(LeaseGrant {
            id: lease_id,
            ttl_secs: lease.ttl_secs,
        })
    }

    async fn lease_revoke(&self, lease_id: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.expire_leases();
        if inner.revoke(lease_id) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound { lease_id })
        }
    }

    async fn lease_time_to_live(&self, lease_id: LeaseId) -> Result<LeaseTimeToLive, StoreError> {
        let mut inner = self.inner.lock();
        inner.expire_leases();
        Ok(match inner.leases.get(&lease_id) {
            Some(lease) => LeaseTimeToLive {
                id: lease_id,
                ttl_secs: lease.deadline.saturating_duration_since(Instant::now()).as_secs() as i64,
                granted_ttl_secs: lease.ttl_secs,
                keys: lease.keys.iter().cloned().collect(),
            },
            None => LeaseTimeToLive {
                id: lease_id,
                ttl_secs: -1,
                granted_ttl_secs: 0,
                keys: Vec::new(),
            },
        })
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = WatchSlot {
            key: request.key,
            is_prefix: request.is_prefix,
            prev_kv: request.prev_kv,
            tx,
        };

        {
            let mut inner = self.inner.lock();
            inner.expire_leases();
            if let Some(start) = request.start_revision {
                if start <= inner.compacted_revision {
                    return Err(StoreError::Compacted {
                        revision: inner.compacted_revision,
                    });
                }
                for (revision, events) in inner.history.iter().filter(|(revision, _)| *revision >= start) {
                    let selected = slot.select(events);
                    if !selected.is_empty() {
                        // The receiver is held locally, so the send cannot fail.
                        let _ = slot.tx.send(Ok(WatchBatch {
                            revision: *revision,
                            events: selected,
                        }));
                    }
                }
            }
            inner.watchers.push(slot);
        }

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })))
    }
}
