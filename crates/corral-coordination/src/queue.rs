//! Priority queue with optimistic claim-by-delete.
//!
//! Entries live at `/priorityQueue/<name>/<priority:05>/<sequence:016>`, so a
//! key-ordered range returns them in service order: lowest priority value
//! first, then insertion order. A consumer claims an entry by deleting it in a
//! transaction guarded by the entry's mod revision; the one consumer whose
//! delete succeeds owns the entry, so each entry is delivered at most once.
//!
//! Queue names never contain `/`, so the prefixes of two queues never nest.
//!
//! Every priority a queue has used is recorded under
//! `__/priorityQueue/<name>/<priority:05>`. Pushes at one priority serialize
//! through that registry key, which keeps sequence numbers unique and
//! increasing within a priority.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use corral_core::Compare;
use corral_core::CompareOp;
use corral_core::CoordinationStore;
use corral_core::DeleteRequest;
use corral_core::EventType;
use corral_core::KeyValue;
use corral_core::PutRequest;
use corral_core::RangeRequest;
use corral_core::Revision;
use corral_core::StoreError;
use corral_core::TxnOp;
use corral_core::TxnOpResult;
use corral_core::TxnRequest;
use corral_core::WatchRequest;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::QueueConfig;
use crate::error::CoordinationError;
use crate::pure::compute_backoff_with_jitter;
use crate::pure::keys;
use crate::retry::WriteRetry;
use crate::retry::with_timeout;

/// An entry removed from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Store key the entry was held under.
    pub key: String,
    pub value: String,
    /// Lower values are served first.
    pub priority: u16,
    /// Insertion-order tiebreak within a priority.
    pub sequence: Revision,
}

/// Outcome of one claim pass.
enum Claim {
    Item(QueueItem),
    /// Nothing to claim as of `revision`.
    Empty { revision: Revision },
}

/// Handle on one named queue.
///
/// Holds no state beyond the name; any number of handles, in any number of
/// processes, may share a queue.
pub struct PriorityQueue<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    name: String,
    prefix: String,
    config: QueueConfig,
    op_timeout: Duration,
    retry: WriteRetry,
    cancel: CancellationToken,
}

impl<S: CoordinationStore + ?Sized + 'static> PriorityQueue<S> {
    /// Open queue `name`. Blocking pops end when `cancel` fires.
    pub fn new(
        store: Arc<S>,
        name: impl Into<String>,
        config: QueueConfig,
        op_timeout: Duration,
        retry: WriteRetry,
        cancel: CancellationToken,
    ) -> Result<Self, CoordinationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(CoordinationError::InvalidParam {
                reason: "queue name must not be empty".to_string(),
            });
        }
        // A '/' would place one queue's keys inside another's prefix.
        if name.contains('/') {
            return Err(CoordinationError::InvalidParam {
                reason: format!("queue name '{name}' must not contain '/'"),
            });
        }
        Ok(Self {
            store,
            prefix: keys::queue_prefix(&name),
            name,
            config,
            op_timeout,
            retry,
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append `value` at `priority`. Returns the entry key.
    #[instrument(skip(self, value), fields(queue = %self.name))]
    pub async fn push(&self, value: &str, priority: u16) -> Result<String, CoordinationError> {
        let registry_key = keys::queue_registry_key(&self.name, priority);
        let mut backoff_ms = self.config.claim_initial_backoff_ms;

        for attempt in 1..=self.config.max_claim_attempts {
            let registry = self
                .retry
                .run("queue registry read", || {
                    let request = RangeRequest::key(&registry_key);
                    with_timeout("queue registry read", self.op_timeout, self.store.range(request))
                })
                .await?;

            // The entry is written at a revision of at least `sequence`; the guard
            // fails if another push at this priority landed in between.
            let sequence = registry.revision + 1;
            let entry_key = keys::queue_entry_key(&self.name, priority, sequence);
            let txn = TxnRequest::new()
                .when(vec![Compare::mod_revision(&registry_key, CompareOp::Less, sequence)])
                .and_then(vec![
                    TxnOp::Put(PutRequest::new(&registry_key, "")),
                    TxnOp::Put(PutRequest::new(&entry_key, value)),
                ]);
            let result = self
                .retry
                .run("queue push", || with_timeout("queue push", self.op_timeout, self.store.txn(txn.clone())))
                .await?;

            if result.succeeded {
                debug!(key = %entry_key, priority, "queue entry pushed");
                return Ok(entry_key);
            }

            debug!(attempt, priority, "queue push contended");
            backoff_ms = self.contention_pause(backoff_ms).await;
        }

        Err(CoordinationError::ContentionExceeded {
            operation: "queue push".to_string(),
            attempts: self.config.max_claim_attempts,
        })
    }

    /// Remove and return the first entry, or `None` if the queue is empty.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn pop(&self) -> Result<Option<QueueItem>, CoordinationError> {
        match self.claim().await? {
            Claim::Item(item) => Ok(Some(item)),
            Claim::Empty { .. } => Ok(None),
        }
    }

    /// Remove and return the first entry, waiting for one to be pushed.
    ///
    /// Fails with `Cancelled` when the owning client closes.
    pub async fn pop_wait(&self) -> Result<QueueItem, CoordinationError> {
        loop {
            let revision = match self.claim().await? {
                Claim::Item(item) => return Ok(item),
                Claim::Empty { revision } => revision,
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(CoordinationError::Cancelled {
                        operation: "queue pop".to_string(),
                    });
                }
                waited = self.wait_for_push(revision + 1) => waited?,
            }
        }
    }

    /// [`pop_wait`](Self::pop_wait) bounded by `timeout`.
    pub async fn pop_timeout(&self, timeout: Duration) -> Result<QueueItem, CoordinationError> {
        match tokio::time::timeout(timeout, self.pop_wait()).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::Timeout {
                operation: "queue pop".to_string(),
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Number of entries currently queued.
    pub async fn len(&self) -> Result<u64, CoordinationError> {
        let request = RangeRequest::prefix(&self.prefix).count_only();
        let range = with_timeout("queue len", self.op_timeout, self.store.range(request)).await?;
        Ok(range.count)
    }

    pub async fn is_empty(&self) -> Result<bool, CoordinationError> {
        Ok(self.len().await? == 0)
    }

    /// Remove every entry and the queue's registry records in one transaction.
    ///
    /// Returns the number of entries removed.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn delete(&self) -> Result<u64, CoordinationError> {
        let txn = TxnRequest::new().and_then(vec![
            TxnOp::Delete(DeleteRequest::prefix(&self.prefix)),
            TxnOp::Delete(DeleteRequest::prefix(keys::queue_registry_prefix(&self.name))),
        ]);
        let result = self
            .retry
            .run("queue delete", || with_timeout("queue delete", self.op_timeout, self.store.txn(txn.clone())))
            .await?;

        let deleted = match result.responses.first() {
            Some(TxnOpResult::Delete(entries)) => entries.deleted,
            _ => 0,
        };
        info!(queue = %self.name, deleted, "queue deleted");
        Ok(deleted)
    }

    /// Fetch-and-claim rounds, bounded by the configured attempts.
    async fn claim(&self) -> Result<Claim, CoordinationError> {
        let request = RangeRequest::prefix(&self.prefix).with_limit(self.config.claim_batch_size);
        let mut backoff_ms = self.config.claim_initial_backoff_ms;

        for attempt in 1..=self.config.max_claim_attempts {
            let batch = with_timeout("queue fetch", self.op_timeout, self.store.range(request.clone())).await?;

            let candidates: Vec<(KeyValue, u16, Revision)> = batch
                .kvs
                .into_iter()
                .filter_map(|kv| {
                    let (priority, sequence) = keys::parse_queue_entry_key(&self.name, &kv.key)?;
                    Some((kv, priority, sequence))
                })
                .collect();
            if candidates.is_empty() {
                return Ok(Claim::Empty {
                    revision: batch.revision,
                });
            }

            for (kv, priority, sequence) in candidates {
                if self.try_claim(&kv).await? {
                    debug!(key = %kv.key, attempt, "queue entry claimed");
                    return Ok(Claim::Item(QueueItem {
                        key: kv.key,
                        value: kv.value,
                        priority,
                        sequence,
                    }));
                }
            }

            debug!(attempt, "every candidate claimed by another consumer");
            backoff_ms = self.contention_pause(backoff_ms).await;
        }

        warn!(queue = %self.name, attempts = self.config.max_claim_attempts, "queue pop gave up under contention");
        Err(CoordinationError::ContentionExceeded {
            operation: "queue pop".to_string(),
            attempts: self.config.max_claim_attempts,
        })
    }

    /// Delete `kv` if nobody touched it since it was read.
    async fn try_claim(&self, kv: &KeyValue) -> Result<bool, CoordinationError> {
        let txn = TxnRequest::new()
            .when(vec![Compare::mod_revision(&kv.key, CompareOp::Equal, kv.mod_revision)])
            .and_then(vec![TxnOp::Delete(DeleteRequest::key(&kv.key))]);
        let result = with_timeout("queue claim", self.op_timeout, self.store.txn(txn)).await?;
        Ok(result.succeeded)
    }

    /// Resolve once something is put under the queue prefix after `start_revision`.
    async fn wait_for_push(&self, start_revision: Revision) -> Result<(), CoordinationError> {
        let request = WatchRequest::prefix(&self.prefix).with_start_revision(start_revision);
        let mut events = match with_timeout("queue watch", self.op_timeout, self.store.watch(request)).await {
            Ok(events) => events,
            // Entries may have been pushed and compacted away; just look again.
            Err(CoordinationError::Store {
                source: StoreError::Compacted { .. },
            }) => return Ok(()),
            Err(e) => return Err(e),
        };

        while let Some(batch) = events.next().await {
            let batch = batch?;
            if batch.events.iter().any(|event| event.event_type == EventType::Put) {
                return Ok(());
            }
        }
        // Stream ended; the caller re-reads the queue.
        Ok(())
    }

    async fn contention_pause(&self, backoff_ms: u64) -> u64 {
        let backoff = compute_backoff_with_jitter(backoff_ms, self.config.claim_max_backoff_ms, rand::random::<u64>());
        tokio::time::sleep(Duration::from_millis(backoff.sleep_ms)).await;
        backoff.next_backoff_ms
    }
}

/// Names of queues starting with `namespace`, sorted and deduplicated.
///
/// An empty namespace lists every queue.
pub async fn list_priority_queues<S: CoordinationStore + ?Sized>(
    store: &S,
    namespace: &str,
    op_timeout: Duration,
) -> Result<Vec<String>, CoordinationError> {
    let prefix = keys::queue_registry_namespace(namespace);
    let registry = with_timeout("queue list", op_timeout, store.range(RangeRequest::prefix(prefix))).await?;

    let names: BTreeSet<&str> =
        registry.kvs.iter().filter_map(|kv| keys::queue_name_from_registry_key(&kv.key)).collect();
    Ok(names.into_iter().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use corral_testing::DeterministicCoordinationStore;

    use super::*;

    const OP_TIMEOUT: Duration = Duration::from_secs(1);

    fn queue(store: &Arc<DeterministicCoordinationStore>, name: &str) -> PriorityQueue<DeterministicCoordinationStore> {
        PriorityQueue::new(
            store.clone(),
            name,
            QueueConfig::default(),
            OP_TIMEOUT,
            WriteRetry::new(3, Duration::from_millis(5)),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn pops_by_priority_then_insertion_order() {
        let store = DeterministicCoordinationStore::new();
        let q = queue(&store, "jobs");

        q.push("A", 1).await.unwrap();
        q.push("B", 2).await.unwrap();
        q.push("C", 1).await.unwrap();

        let mut order = Vec::new();
        while let Some(item) = q.pop().await.unwrap() {
            order.push(item.value);
        }
        assert_eq!(order, vec!["A", "C", "B"]);
    }

    #[tokio::test]
    async fn popped_item_carries_priority_and_sequence() {
        let store = DeterministicCoordinationStore::new();
        let q = queue(&store, "jobs");

        let key = q.push("payload", 7).await.unwrap();
        let item = q.pop().await.unwrap().unwrap();

        assert_eq!(item.key, key);
        assert_eq!(item.priority, 7);
        assert!(item.sequence > 0);
        assert_eq!(q.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_queue_pops_none() {
        let store = DeterministicCoordinationStore::new();
        assert_eq!(queue(&store, "empty").pop().await.unwrap(), None);
    }

    #[test]
    fn slash_in_name_is_rejected() {
        let store = DeterministicCoordinationStore::new();
        let result = PriorityQueue::new(
            store,
            "jobs/urgent",
            QueueConfig::default(),
            OP_TIMEOUT,
            WriteRetry::new(1, Duration::ZERO),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(CoordinationError::InvalidParam { .. })));
    }

    #[tokio::test]
    async fn queues_sharing_a_name_prefix_stay_apart() {
        let store = DeterministicCoordinationStore::new();
        let jobs = queue(&store, "jobs");
        let hot = queue(&store, "jobs-hot");
        for i in 0..20 {
            hot.push(&format!("hot-{i}"), 0).await.unwrap();
        }
        jobs.push("mine", 5).await.unwrap();

        assert_eq!(jobs.len().await.unwrap(), 1);
        assert_eq!(jobs.pop().await.unwrap().map(|item| item.value), Some("mine".to_string()));
        assert_eq!(jobs.pop().await.unwrap(), None);

        jobs.push("again", 1).await.unwrap();
        assert_eq!(jobs.delete().await.unwrap(), 1);
        assert_eq!(hot.len().await.unwrap(), 20);
        assert_eq!(list_priority_queues(store.as_ref(), "", OP_TIMEOUT).await.unwrap(), vec!["jobs-hot"]);
    }

    #[tokio::test]
    async fn delete_empties_queue_and_registry() {
        let store = DeterministicCoordinationStore::new();
        let q = queue(&store, "jobs");
        q.push("a", 1).await.unwrap();
        q.push("b", 3).await.unwrap();
        assert_eq!(q.len().await.unwrap(), 2);

        assert_eq!(q.delete().await.unwrap(), 2);

        assert_eq!(q.len().await.unwrap(), 0);
        assert!(list_priority_queues(store.as_ref(), "", OP_TIMEOUT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_push_failure_is_retried() {
        let store = DeterministicCoordinationStore::new();
        let q = queue(&store, "jobs");

        store.fail_next_writes(2);
        q.push("a", 1).await.unwrap();

        assert_eq!(q.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lists_distinct_queue_names() {
        let store = DeterministicCoordinationStore::new();
        queue(&store, "team-b").push("x", 1).await.unwrap();
        queue(&store, "team-a").push("x", 1).await.unwrap();
        queue(&store, "team-a").push("y", 2).await.unwrap();
        queue(&store, "other").push("z", 1).await.unwrap();

        let names = list_priority_queues(store.as_ref(), "team-", OP_TIMEOUT).await.unwrap();
        assert_eq!(names, vec!["team-a", "team-b"]);
    }

    #[tokio::test]
    async fn pop_wait_returns_entry_pushed_later() {
        let store = DeterministicCoordinationStore::new();
        let q = Arc::new(queue(&store, "jobs"));

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop_timeout(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue(&store, "jobs").push("late", 1).await.unwrap();

        let item = waiter.await.unwrap().unwrap();
        assert_eq!(item.value, "late");
    }

    #[tokio::test]
    async fn pop_timeout_expires_on_empty_queue() {
        let store = DeterministicCoordinationStore::new();
        let result = queue(&store, "jobs").pop_timeout(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CoordinationError::Timeout { .. })));
    }

    #[tokio::test]
    async fn pop_wait_is_cancelled() {
        let store = DeterministicCoordinationStore::new();
        let cancel = CancellationToken::new();
        let q = PriorityQueue::new(
            store.clone(),
            "jobs",
            QueueConfig::default(),
            OP_TIMEOUT,
            WriteRetry::new(1, Duration::ZERO),
            cancel.clone(),
        )
        .unwrap();

        cancel.cancel();
        assert!(matches!(q.pop_wait().await, Err(CoordinationError::Cancelled { .. })));
    }

    #[test]
    fn empty_name_is_rejected() {
        let store = DeterministicCoordinationStore::new();
        let result = PriorityQueue::new(
            store,
            "",
            QueueConfig::default(),
            OP_TIMEOUT,
            WriteRetry::new(1, Duration::ZERO),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(CoordinationError::InvalidParam { .. })));
    }
}
