//! Reconnecting prefix watcher.
//!
//! One background task keeps a prefix watch open. Streams are reopened after a
//! rolling window even when healthy, and after any closure or error. A closure
//! is reported once as [`WatchNotification::Disconnected`]; the replacement
//! stream resumes from the revision after the last delivered batch, or from the
//! revision the first stream started at, so no event is skipped unless the
//! store compacted it away meanwhile.
//!
//! Callback subscribers get every event through a bounded [`WorkerPool`], with
//! no ordering between events. Channel subscribers get events in stream order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use corral_core::CoordinationStore;
use corral_core::EventType;
use corral_core::RangeRequest;
use corral_core::Revision;
use corral_core::StoreError;
use corral_core::WatchBatch;
use corral_core::WatchEvent;
use corral_core::WatchRequest;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::WatcherConfig;
use crate::error::CoordinationError;
use crate::notify::Notifier;
use crate::pool::WorkerPool;
use crate::retry::with_timeout;

/// Kind of change carried by an [`UpdateEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEventType {
    Put,
    Delete,
    /// A kind this client does not recognise.
    Unknown,
}

impl fmt::Display for UpdateEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateEventType::Put => write!(f, "PUT"),
            UpdateEventType::Delete => write!(f, "DELETE"),
            UpdateEventType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub kind: UpdateEventType,
    pub key: String,
    /// New value. Empty for deletes.
    pub value: String,
    /// Key before the change, when it existed.
    pub prev_key: Option<String>,
    /// Value before the change, when it existed.
    pub prev_value: Option<String>,
    /// Revision of the change.
    pub revision: Revision,
}

impl UpdateEvent {
    fn from_watch_event(event: WatchEvent) -> Self {
        let kind = match event.event_type {
            EventType::Put => UpdateEventType::Put,
            EventType::Delete => UpdateEventType::Delete,
            _ => UpdateEventType::Unknown,
        };
        let (prev_key, prev_value) = match event.prev_kv {
            Some(prev) => (Some(prev.key), Some(prev.value)),
            None => (None, None),
        };
        Self {
            kind,
            revision: event.kv.mod_revision,
            key: event.kv.key,
            value: event.kv.value,
            prev_key,
            prev_value,
        }
    }
}

impl fmt::Display for UpdateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)?;
        if self.kind == UpdateEventType::Put {
            write!(f, "={}", self.value)?;
        }
        if let Some(prev) = &self.prev_value {
            write!(f, " (was {prev})")?;
        }
        write!(f, " @{}", self.revision)
    }
}

/// What a watcher subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotification {
    /// A change under the prefix.
    Event(UpdateEvent),
    /// The stream closed; the watcher is reconnecting.
    Disconnected,
}

pub(crate) struct WatcherParams {
    pub prefix: String,
    pub config: WatcherConfig,
    pub op_timeout: Duration,
}

/// Handle to a running watcher.
pub struct WatcherHandle {
    prefix: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the watch loop and wait for in-flight callbacks.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(prefix = %self.prefix, error = %e, "watcher task failed");
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start watching `params.prefix`.
pub(crate) fn spawn<S: CoordinationStore + ?Sized + 'static>(
    store: Arc<S>,
    params: WatcherParams,
    notifier: Notifier<WatchNotification>,
    parent: &CancellationToken,
) -> Result<WatcherHandle, CoordinationError> {
    if params.prefix.is_empty() {
        return Err(CoordinationError::InvalidParam {
            reason: "watch prefix must not be empty".to_string(),
        });
    }

    let cancel = parent.child_token();
    let prefix = params.prefix.clone();
    let pool = WorkerPool::new(params.config.pool_capacity);
    let task = tokio::spawn(
        WatchLoop {
            store,
            params,
            notifier,
            pool,
            cancel: cancel.clone(),
            next_revision: None,
        }
        .run(),
    );
    info!(prefix = %prefix, "watcher started");

    Ok(WatcherHandle {
        prefix,
        cancel,
        task: Some(task),
    })
}

/// Why a stream stopped.
enum StreamEnd {
    /// The window elapsed; reopen silently.
    Window,
    /// The stream closed or failed; report and reopen.
    Closed,
    /// Cancelled, or the subscriber went away.
    Stop,
}

struct WatchLoop<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    params: WatcherParams,
    notifier: Notifier<WatchNotification>,
    pool: WorkerPool,
    cancel: CancellationToken,
    /// Revision to resume from after a reconnect.
    next_revision: Option<Revision>,
}

impl<S: CoordinationStore + ?Sized + 'static> WatchLoop<S> {
    async fn run(mut self) {
        while !self.notifier.is_closed() {
            let end = self.watch_once().await;
            match end {
                StreamEnd::Stop => break,
                StreamEnd::Window => {
                    debug!(prefix = %self.params.prefix, "watch window elapsed, reopening");
                }
                StreamEnd::Closed => {
                    if !self.notifier.notify(WatchNotification::Disconnected).await {
                        break;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.params.config.reconnect_delay()) => {}
                    }
                }
            }
        }

        self.pool.drain().await;
        info!(prefix = %self.params.prefix, "watcher stopped");
    }

    async fn watch_once(&mut self) -> StreamEnd {
        let start = match self.next_revision {
            Some(revision) => revision,
            None => match self.current_revision().await {
                Ok(revision) => revision + 1,
                Err(end) => return end,
            },
        };
        // Pinned before any event arrives, so a reconnect resumes from here.
        self.next_revision = Some(start);
        let request = WatchRequest::prefix(self.params.prefix.clone())
            .with_prev_kv()
            .with_start_revision(start);

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return StreamEnd::Stop,
            opened = with_timeout("watch", self.params.op_timeout, self.store.watch(request)) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.note_failure(&e);
                return StreamEnd::Closed;
            }
        };
        debug!(prefix = %self.params.prefix, start_revision = ?self.next_revision, "watch stream opened");

        let window = tokio::time::sleep(self.params.config.window());
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Stop,
                _ = &mut window => return StreamEnd::Window,
                item = stream.next() => match item {
                    Some(Ok(batch)) => {
                        if !self.dispatch(batch).await {
                            return StreamEnd::Stop;
                        }
                    }
                    Some(Err(e)) => {
                        self.note_failure(&CoordinationError::from(e));
                        return StreamEnd::Closed;
                    }
                    None => {
                        warn!(prefix = %self.params.prefix, "watch stream closed");
                        return StreamEnd::Closed;
                    }
                },
            }
        }
    }

    /// Store revision as of now, read from an empty count of the prefix.
    async fn current_revision(&mut self) -> Result<Revision, StreamEnd> {
        let request = RangeRequest::prefix(self.params.prefix.clone()).count_only();
        let read = tokio::select! {
            _ = self.cancel.cancelled() => return Err(StreamEnd::Stop),
            read = with_timeout("watch start", self.params.op_timeout, self.store.range(request)) => read,
        };
        read.map(|range| range.revision).map_err(|e| {
            self.note_failure(&e);
            StreamEnd::Closed
        })
    }

    fn note_failure(&mut self, error: &CoordinationError) {
        if let CoordinationError::Store {
            source: StoreError::Compacted { revision },
        } = error
        {
            warn!(prefix = %self.params.prefix, compacted = revision, "resume revision compacted, restarting from now");
            self.next_revision = None;
        } else {
            warn!(prefix = %self.params.prefix, error = %error, "watch stream failed");
        }
    }

    /// Hand a batch to the subscriber. False once a channel subscriber is gone.
    async fn dispatch(&mut self, batch: WatchBatch) -> bool {
        self.next_revision = Some(batch.revision + 1);

        for event in batch.events {
            let notification = WatchNotification::Event(UpdateEvent::from_watch_event(event));
            match &self.notifier {
                Notifier::Callback(callback) => {
                    let callback = callback.clone();
                    if let Err(e) = self.pool.submit(async move { callback(notification) }) {
                        warn!(prefix = %self.params.prefix, error = %e, "dropping watch event");
                    }
                }
                Notifier::Channel(_) => {
                    if !self.notifier.notify(notification).await {
                        debug!(prefix = %self.params.prefix, "watch subscriber dropped");
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use corral_core::DeleteRequest;
    use corral_core::PutRequest;
    use corral_testing::DeterministicCoordinationStore;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;

    fn params(prefix: &str) -> WatcherParams {
        WatcherParams {
            prefix: prefix.to_string(),
            config: WatcherConfig {
                pool_capacity: 16,
                window_secs: 900,
                reconnect_delay_ms: 50,
                subscription_capacity: 16,
            },
            op_timeout: Duration::from_secs(1),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<WatchNotification>) -> WatchNotification {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    async fn wait_for_watchers(store: &DeterministicCoordinationStore, count: usize) {
        for _ in 0..200 {
            if store.watcher_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watch stream never opened");
    }

    #[tokio::test]
    async fn delivers_puts_and_deletes_in_order() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn(store.clone(), params("/cfg/"), Notifier::Channel(tx), &root).unwrap();
        wait_for_watchers(&store, 1).await;

        store.put(PutRequest::new("/cfg/a", "1")).await.unwrap();
        store.put(PutRequest::new("/other", "x")).await.unwrap();
        store.put(PutRequest::new("/cfg/a", "2")).await.unwrap();
        store.delete(DeleteRequest::key("/cfg/a")).await.unwrap();

        let WatchNotification::Event(first) = next_event(&mut rx).await else {
            panic!("expected event");
        };
        assert_eq!((first.kind, first.value.as_str(), first.prev_value), (UpdateEventType::Put, "1", None));

        let WatchNotification::Event(second) = next_event(&mut rx).await else {
            panic!("expected event");
        };
        assert_eq!(second.prev_value.as_deref(), Some("1"));

        let WatchNotification::Event(third) = next_event(&mut rx).await else {
            panic!("expected event");
        };
        assert_eq!(third.kind, UpdateEventType::Delete);
        assert_eq!(third.prev_key.as_deref(), Some("/cfg/a"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn reconnects_after_stream_closure_without_losing_events() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn(store.clone(), params("/svc/"), Notifier::Channel(tx), &root).unwrap();
        wait_for_watchers(&store, 1).await;

        store.put(PutRequest::new("/svc/a", "before")).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, WatchNotification::Event(_)));

        store.close_watch_streams();
        // Written while the watcher is between streams.
        store.put(PutRequest::new("/svc/b", "during")).await.unwrap();

        assert_eq!(next_event(&mut rx).await, WatchNotification::Disconnected);
        let WatchNotification::Event(resumed) = next_event(&mut rx).await else {
            panic!("expected resumed event");
        };
        assert_eq!(resumed.key, "/svc/b");

        wait_for_watchers(&store, 1).await;
        store.put(PutRequest::new("/svc/c", "after")).await.unwrap();
        let WatchNotification::Event(after) = next_event(&mut rx).await else {
            panic!("expected event after reconnect");
        };
        assert_eq!(after.key, "/svc/c");
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        handle.stop().await;
    }

    #[tokio::test]
    async fn closure_before_any_event_resumes_from_subscription_start() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        store.put(PutRequest::new("/svc/old", "existing")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn(store.clone(), params("/svc/"), Notifier::Channel(tx), &root).unwrap();
        wait_for_watchers(&store, 1).await;

        store.close_watch_streams();
        store.put(PutRequest::new("/svc/gap", "during")).await.unwrap();

        assert_eq!(next_event(&mut rx).await, WatchNotification::Disconnected);
        let WatchNotification::Event(resumed) = next_event(&mut rx).await else {
            panic!("expected the write made between streams");
        };
        assert_eq!(resumed.key, "/svc/gap");
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        handle.stop().await;
    }

    #[tokio::test]
    async fn callback_mode_dispatches_every_event() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = Arc::new(move |notification: WatchNotification| {
            if let WatchNotification::Event(event) = notification {
                sink.lock().push(event.key);
            }
        });
        let handle = spawn(store.clone(), params("/jobs/"), Notifier::Callback(callback), &root).unwrap();
        wait_for_watchers(&store, 1).await;

        for i in 0..10 {
            store.put(PutRequest::new(format!("/jobs/{i}"), "x")).await.unwrap();
        }

        for _ in 0..200 {
            if seen.lock().len() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut keys = seen.lock().clone();
        keys.sort();
        assert_eq!(keys.len(), 10);

        handle.stop().await;
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn window_expiry_reopens_silently() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let mut p = params("/w/");
        p.config.window_secs = 1;
        let handle = spawn(store.clone(), p, Notifier::Channel(tx), &root).unwrap();
        wait_for_watchers(&store, 1).await;

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        store.put(PutRequest::new("/w/k", "v")).await.unwrap();

        assert!(matches!(next_event(&mut rx).await, WatchNotification::Event(_)));
        handle.stop().await;
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_the_loop() {
        let store = DeterministicCoordinationStore::new();
        let root = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let handle = spawn(store.clone(), params("/d/"), Notifier::Channel(tx), &root).unwrap();
        wait_for_watchers(&store, 1).await;
        drop(rx);

        store.put(PutRequest::new("/d/k", "v")).await.unwrap();

        for _ in 0..200 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!handle.is_running());
    }

    #[test]
    fn update_event_display() {
        let event = UpdateEvent {
            kind: UpdateEventType::Put,
            key: "/cfg/a".to_string(),
            value: "2".to_string(),
            prev_key: Some("/cfg/a".to_string()),
            prev_value: Some("1".to_string()),
            revision: 9,
        };
        assert_eq!(event.to_string(), "PUT /cfg/a=2 (was 1) @9");
    }
}
