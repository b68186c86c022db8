//! Leader election over candidate keys.
//!
//! Every participant owns a session. A campaign writes
//! `<election-key>/<lease-hex>` holding the node name and completes once every
//! candidate created earlier is gone; the oldest candidate is the leader.
//!
//! The engine runs a monitor loop on a background task:
//!
//! ```text
//! Initializing -> NoLeaderObserved -> CampaignInProgress -> Leader | Follower
//!                        ^                                        |
//!                        +----------------------------------------+
//! ```
//!
//! Each iteration queries the current leader and reports one
//! [`LeadershipEvent`]. Events of one election are delivered strictly in order.

use std::sync::Arc;
use std::time::Duration;

use corral_core::Compare;
use corral_core::CompareOp;
use corral_core::CoordinationStore;
use corral_core::DeleteRequest;
use corral_core::PutRequest;
use corral_core::RangeRequest;
use corral_core::SortOrder;
use corral_core::SortTarget;
use corral_core::TxnOp;
use corral_core::TxnRequest;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ElectionConfig;
use crate::error::CoordinationError;
use crate::lock::wait_for_predecessors;
use crate::notify::Notifier;
use crate::pure::LeaderObservation;
use crate::pure::keys;
use crate::pure::observe_leader;
use crate::retry::with_timeout;
use crate::session::Session;

/// Where the election state machine currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    /// Started, no observation yet.
    Initializing,
    /// The last query found no leader.
    NoLeaderObserved,
    /// A campaign is in flight.
    CampaignInProgress,
    /// Another node leads.
    Follower {
        /// Name of the leader.
        leader: String,
    },
    /// This node leads.
    Leader,
    /// The monitor loop has exited.
    Stopped,
}

impl ElectionState {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionState::Leader)
    }
}

/// One observation reported by the monitor loop.
#[derive(Debug, Clone)]
pub enum LeadershipEvent {
    /// Emitted once at start: leadership is unknown and must be assumed lost.
    Reset,
    /// No candidate holds the election; a campaign follows.
    NoLeader,
    /// This node is the leader.
    Elected,
    /// Another node is the leader.
    Following {
        /// Name of the leader.
        leader: String,
    },
    /// The leader could not be determined.
    QueryFailed {
        /// Why the query failed.
        error: CoordinationError,
    },
}

impl LeadershipEvent {
    /// True only for [`LeadershipEvent::Elected`].
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipEvent::Elected)
    }

    pub fn error(&self) -> Option<&CoordinationError> {
        match self {
            LeadershipEvent::QueryFailed { error } => Some(error),
            _ => None,
        }
    }
}

/// Parameters of one election participant.
pub(crate) struct ElectionParams {
    pub key: String,
    pub node_name: String,
    pub config: ElectionConfig,
    pub op_timeout: Duration,
}

/// The monitor loop and everything it owns.
struct ElectionEngine<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    params: ElectionParams,
    prefix: String,
    session: Session<S>,
    candidate: Arc<parking_lot::Mutex<Option<String>>>,
    state: watch::Sender<ElectionState>,
    notifier: Notifier<LeadershipEvent>,
    cancel: CancellationToken,
}

/// Handle to a running election participant.
pub struct ElectionHandle<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    node_name: String,
    op_timeout: Duration,
    state: watch::Receiver<ElectionState>,
    candidate: Arc<parking_lot::Mutex<Option<String>>>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Create the session and start the monitor loop.
///
/// Session creation failures are returned and no task is spawned.
pub(crate) async fn start<S: CoordinationStore + ?Sized + 'static>(
    store: Arc<S>,
    params: ElectionParams,
    notifier: Notifier<LeadershipEvent>,
    parent: &CancellationToken,
) -> Result<ElectionHandle<S>, CoordinationError> {
    if params.key.is_empty() {
        return Err(CoordinationError::InvalidParam {
            reason: "election key must not be empty".to_string(),
        });
    }

    let cancel = parent.child_token();
    let session =
        Session::new(store.clone(), params.config.effective_session_ttl_secs(), params.op_timeout, &cancel).await?;
    let (state_tx, state_rx) = watch::channel(ElectionState::Initializing);
    let candidate = Arc::new(parking_lot::Mutex::new(None));

    let handle_key = params.key.clone();
    let handle_node = params.node_name.clone();
    let op_timeout = params.op_timeout;
    let engine = ElectionEngine {
        store: store.clone(),
        prefix: keys::election_prefix(&params.key),
        params,
        session,
        candidate: candidate.clone(),
        state: state_tx,
        notifier,
        cancel: cancel.clone(),
    };
    info!(key = %handle_key, node = %handle_node, "election started");
    let task = tokio::spawn(engine.run());

    Ok(ElectionHandle {
        store,
        key: handle_key,
        node_name: handle_node,
        op_timeout,
        state: state_rx,
        candidate,
        cancel,
        task: parking_lot::Mutex::new(Some(task)),
    })
}

impl<S: CoordinationStore + ?Sized + 'static> ElectionEngine<S> {
    async fn run(mut self) {
        let mut running = self.emit(LeadershipEvent::Reset).await;

        while running && !self.cancel.is_cancelled() {
            if self.session.is_expired()
                && let Err(error) = self.renew_session().await
            {
                warn!(key = %self.params.key, error = %error, "failed to renew election session");
                running = self.emit(LeadershipEvent::QueryFailed { error }).await
                    && self.pause(self.params.config.error_backoff()).await;
                continue;
            }

            let observed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.query_leader() => result,
            };

            running = match observed {
                Err(error) => {
                    warn!(key = %self.params.key, error = %error, "leader query failed");
                    self.emit(LeadershipEvent::QueryFailed { error }).await
                        && self.pause(self.params.config.error_backoff()).await
                }
                Ok(leader) => match observe_leader(leader.as_deref(), &self.params.node_name) {
                    LeaderObservation::NoLeader => {
                        self.state.send_replace(ElectionState::NoLeaderObserved);
                        if self.emit(LeadershipEvent::NoLeader).await {
                            self.state.send_replace(ElectionState::CampaignInProgress);
                            self.campaign_once().await
                        } else {
                            false
                        }
                    }
                    LeaderObservation::Elected => {
                        self.state.send_replace(ElectionState::Leader);
                        self.emit(LeadershipEvent::Elected).await
                            && self.pause(self.params.config.observe_interval()).await
                    }
                    LeaderObservation::Following { leader } => {
                        self.state.send_replace(ElectionState::Follower { leader: leader.clone() });
                        self.emit(LeadershipEvent::Following { leader }).await
                            && self.pause(self.params.config.observe_interval()).await
                    }
                },
            };
        }

        self.state.send_replace(ElectionState::Stopped);
        if let Err(e) = self.session.close().await {
            warn!(key = %self.params.key, error = %e, "failed to close election session");
        }
        info!(key = %self.params.key, node = %self.params.node_name, "election stopped");
    }

    /// Deliver an event. False once a channel subscriber has gone away.
    async fn emit(&self, event: LeadershipEvent) -> bool {
        let delivered = self.notifier.notify(event).await;
        if !delivered {
            debug!(key = %self.params.key, "election subscriber dropped, stopping");
        }
        delivered
    }

    /// Sleep unless cancelled. False when cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn renew_session(&mut self) -> Result<(), CoordinationError> {
        let ttl = self.params.config.effective_session_ttl_secs();
        let session = Session::new(self.store.clone(), ttl, self.params.op_timeout, &self.cancel).await?;
        info!(key = %self.params.key, lease_id = session.lease_id(), "election session renewed");
        // The old candidate key went away with the expired lease.
        self.candidate.lock().take();
        self.session = session;
        Ok(())
    }

    /// Value of the oldest candidate, if any.
    async fn query_leader(&self) -> Result<Option<String>, CoordinationError> {
        let request = RangeRequest::prefix(self.prefix.clone())
            .sorted_by(SortTarget::CreateRevision, SortOrder::Ascend)
            .with_limit(1);
        let response = with_timeout("leader query", self.params.op_timeout, self.store.range(request)).await?;
        Ok(response.kvs.into_iter().next().map(|kv| kv.value))
    }

    /// Run one bounded campaign. False when cancelled.
    async fn campaign_once(&self) -> bool {
        let timeout = self.params.config.campaign_timeout();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            result = tokio::time::timeout(timeout, self.campaign()) => result,
        };

        match outcome {
            Ok(Ok(())) => info!(key = %self.params.key, node = %self.params.node_name, "campaign succeeded"),
            Ok(Err(e)) => {
                warn!(key = %self.params.key, error = %e, "campaign failed");
                if e.is_lease_lost() {
                    self.session.mark_expired();
                }
                self.withdraw().await;
            }
            Err(_) => {
                debug!(key = %self.params.key, timeout_ms = timeout.as_millis() as u64, "campaign timed out");
                self.withdraw().await;
            }
        }
        true
    }

    async fn campaign(&self) -> Result<(), CoordinationError> {
        let lease = self.session.lease_id();
        let my_key = keys::election_candidate_key(&self.params.key, lease);
        let node = self.params.node_name.clone();

        let request = TxnRequest::new()
            .when(vec![Compare::create_revision(my_key.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::Put(PutRequest::new(my_key.clone(), node.clone()).with_lease(lease))])
            .or_else(vec![TxnOp::Range(RangeRequest::key(my_key.clone()))]);
        let response = with_timeout("campaign", self.params.op_timeout, self.store.txn(request)).await?;
        *self.candidate.lock() = Some(my_key.clone());

        let my_revision = if response.succeeded {
            response.revision
        } else {
            let existing = response
                .first_range()
                .and_then(|range| range.kvs.first())
                .ok_or(CoordinationError::SessionExpired { lease_id: lease })?;
            if existing.value != node {
                let put = PutRequest::new(my_key.clone(), node).with_lease(lease);
                with_timeout("campaign", self.params.op_timeout, self.store.put(put)).await?;
            }
            existing.create_revision
        };

        wait_for_predecessors(self.store.as_ref(), &self.prefix, my_revision, self.params.op_timeout).await?;

        let mine = with_timeout("campaign", self.params.op_timeout, self.store.range(RangeRequest::key(my_key))).await?;
        if mine.kvs.is_empty() {
            return Err(CoordinationError::SessionExpired { lease_id: lease });
        }
        Ok(())
    }

    /// Remove this node's candidate key after a failed campaign.
    async fn withdraw(&self) {
        if let Err(e) = resign(self.store.as_ref(), &self.candidate, self.params.op_timeout).await {
            warn!(key = %self.params.key, error = %e, "failed to withdraw candidate");
        }
    }
}

async fn resign<S: CoordinationStore + ?Sized>(
    store: &S,
    candidate: &parking_lot::Mutex<Option<String>>,
    op_timeout: Duration,
) -> Result<(), CoordinationError> {
    let key = candidate.lock().take();
    if let Some(key) = key {
        with_timeout("resign", op_timeout, store.delete(DeleteRequest::key(key))).await?;
    }
    Ok(())
}

impl<S: CoordinationStore + ?Sized + 'static> ElectionHandle<S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Current state of the state machine.
    pub fn state(&self) -> ElectionState {
        self.state.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_leader()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ElectionState> {
        self.state.clone()
    }

    /// Give up leadership or candidacy by deleting this node's candidate key.
    ///
    /// The monitor loop keeps running and will campaign again once it observes
    /// no leader.
    pub async fn resign(&self) -> Result<(), CoordinationError> {
        resign(self.store.as_ref(), &self.candidate, self.op_timeout).await?;
        info!(key = %self.key, node = %self.node_name, "resigned");
        Ok(())
    }

    /// Stop the monitor loop and close the session.
    ///
    /// Closing the session revokes its lease, which removes the candidate key.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(key = %self.key, error = %e, "election task failed");
        }
    }
}

impl<S: CoordinationStore + ?Sized + 'static> Drop for ElectionHandle<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
