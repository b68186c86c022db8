use std::time::Duration;

use async_trait::async_trait;
use corral_core::CoordinationStore;
use corral_core::DeleteRequest;
use corral_core::DeleteResult;
use corral_core::EventType;
use corral_core::LeaseGrant;
use corral_core::LeaseId;
use corral_core::LeaseTimeToLive;
use corral_core::PutRequest;
use corral_core::PutResult;
use corral_core::RangeRequest;
use corral_core::RangeResult;
use corral_core::StoreError;
use corral_core::TxnRequest;
use corral_core::TxnResult;
use corral_core::WatchBatch;
use corral_core::WatchEvent;
use corral_core::WatchRequest;
use corral_core::WatchStream;
use etcd_client::Client;
use etcd_client::ConnectOptions;
use etcd_client::LeaseTimeToLiveOptions;
use etcd_client::WatchOptions;
use futures::stream;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::EtcdConfig;
use crate::convert;
use crate::convert::map_error;

/// A [`CoordinationStore`] backed by an etcd v3 cluster.
///
/// Cheap to clone: all clones share the underlying gRPC channel.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    request_timeout_ms: u64,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").field("request_timeout_ms", &self.request_timeout_ms).finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connect to the cluster described by `config`.
    pub async fn connect(config: &EtcdConfig) -> Result<Self, StoreError> {
        if config.endpoints.is_empty() {
            return Err(StoreError::InvalidRequest {
                reason: "at least one etcd endpoint is required".to_string(),
            });
        }

        let keep_alive = Duration::from_millis(config.keep_alive_ms);
        let mut options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_millis(config.dial_timeout_ms))
            .with_timeout(Duration::from_millis(config.request_timeout_ms))
            .with_keep_alive(keep_alive, keep_alive);
        if let Some((user, password)) = config.credentials() {
            options = options.with_user(user, password);
        }

        let client = Client::connect(&config.endpoints, Some(options)).await.map_err(map_error)?;
        info!(endpoints = ?config.endpoints, "connected to etcd");

        Ok(Self {
            client,
            request_timeout_ms: config.request_timeout_ms,
        })
    }

    fn fail(&self, err: etcd_client::Error) -> StoreError {
        match map_error(err) {
            StoreError::Timeout { .. } => StoreError::Timeout {
                duration_ms: self.request_timeout_ms,
            },
            other => other,
        }
    }

    fn fail_lease(&self, err: etcd_client::Error, lease_id: LeaseId) -> StoreError {
        match self.fail(err) {
            StoreError::LeaseNotFound { .. } => StoreError::LeaseNotFound { lease_id },
            other => other,
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn range(&self, request: RangeRequest) -> Result<RangeResult, StoreError> {
        let options = convert::get_options(&request);
        let response = self.client.kv_client().get(request.key, Some(options)).await.map_err(|e| self.fail(e))?;
        Ok(convert::range_result(&response))
    }

    async fn put(&self, request: PutRequest) -> Result<PutResult, StoreError> {
        let options = convert::put_options(&request);
        let lease = request.lease.unwrap_or_default();
        let response = self
            .client
            .kv_client()
            .put(request.key, request.value, Some(options))
            .await
            .map_err(|e| self.fail_lease(e, lease))?;
        Ok(convert::put_result(&response))
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, StoreError> {
        let options = convert::delete_options(&request);
        let response = self.client.kv_client().delete(request.key, Some(options)).await.map_err(|e| self.fail(e))?;
        Ok(convert::delete_result(&response))
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResult, StoreError> {
        let response = self.client.kv_client().txn(convert::txn(&request)).await.map_err(|e| self.fail(e))?;
        Ok(convert::txn_result(&response))
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrant, StoreError> {
        let response = self.client.lease_client().grant(ttl_secs, None).await.map_err(|e| self.fail(e))?;
        debug!(lease_id = response.id(), ttl_secs = response.ttl(), "lease granted");
        Ok(LeaseGrant {
            id: response.id(),
            ttl_secs: response.ttl(),
        })
    }

    async fn lease_keep_alive_once(&self, lease_id: LeaseId) -> Result<LeaseGrant, StoreError> {
        let mut leases = self.client.lease_client();
        let (mut keeper, mut responses) = leases.keep_alive(lease_id).await.map_err(|e| self.fail_lease(e, lease_id))?;
        keeper.keep_alive().await.map_err(|e| self.fail_lease(e, lease_id))?;

        match responses.message().await.map_err(|e| self.fail_lease(e, lease_id))? {
            // etcd answers a refresh of an unknown lease with TTL 0.
            Some(response) if response.ttl() > 0 => Ok(LeaseGrant {
                id: lease_id,
                ttl_secs: response.ttl(),
            }),
            _ => Err(StoreError::LeaseNotFound { lease_id }),
        }
    }

    async fn lease_revoke(&self, lease_id: LeaseId) -> Result<(), StoreError> {
        self.client.lease_client().revoke(lease_id).await.map_err(|e| self.fail_lease(e, lease_id))?;
        debug!(lease_id, "lease revoked");
        Ok(())
    }

    async fn lease_time_to_live(&self, lease_id: LeaseId) -> Result<LeaseTimeToLive, StoreError> {
        let options = LeaseTimeToLiveOptions::new().with_keys();
        let response = self
            .client
            .lease_client()
            .time_to_live(lease_id, Some(options))
            .await
            .map_err(|e| self.fail_lease(e, lease_id))?;
        Ok(LeaseTimeToLive {
            id: lease_id,
            ttl_secs: response.ttl(),
            granted_ttl_secs: response.granted_ttl(),
            keys: response.keys().iter().map(|key| String::from_utf8_lossy(key).into_owned()).collect(),
        })
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, StoreError> {
        let mut options = WatchOptions::new();
        if request.is_prefix {
            options = options.with_prefix();
        }
        if request.prev_kv {
            options = options.with_prev_key();
        }
        if let Some(revision) = request.start_revision {
            options = options.with_start_revision(revision);
        }

        let (watcher, messages) =
            self.client.watch_client().watch(request.key.as_str(), Some(options)).await.map_err(|e| self.fail(e))?;
        debug!(key = %request.key, watch_id = watcher.watch_id(), "watch opened");

        // The watcher handle travels with the stream: dropping it cancels the watch.
        let state = Some((watcher, messages));
        let batches = stream::unfold(state, |state| async move {
            let (watcher, mut messages) = state?;
            loop {
                match messages.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            let compacted = response.compact_revision();
                            if compacted > 0 {
                                return Some((Err(StoreError::Compacted { revision: compacted }), None));
                            }
                            debug!(watch_id = watcher.watch_id(), reason = %response.cancel_reason(), "watch canceled");
                            return None;
                        }
                        let events: Vec<WatchEvent> = response
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = event.kv()?;
                                Some(WatchEvent {
                                    event_type: match event.event_type() {
                                        etcd_client::EventType::Put => EventType::Put,
                                        etcd_client::EventType::Delete => EventType::Delete,
                                    },
                                    kv: convert::key_value(kv),
                                    prev_kv: event.prev_kv().map(convert::key_value),
                                })
                            })
                            .collect();
                        // Creation acknowledgements and progress notifications carry no events.
                        let Some(last) = events.last() else {
                            continue;
                        };
                        let batch = WatchBatch {
                            revision: last.kv.mod_revision,
                            events,
                        };
                        return Some((Ok(batch), Some((watcher, messages))));
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        warn!(error = %err, "watch stream failed");
                        return Some((Err(map_error(err)), None));
                    }
                }
            }
        });

        Ok(Box::pin(batches))
    }
}
