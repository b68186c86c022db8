//! Watch stream types.

use futures::stream::BoxStream;
use serde::Deserialize;
use serde::Serialize;

use crate::error::StoreError;
use crate::kv::KeyValue;
use crate::kv::Revision;

/// Watch a key or prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    /// Exact key, or the prefix when `is_prefix` is set.
    pub key: String,
    /// Watch every key starting with `key`.
    pub is_prefix: bool,
    /// Include the previous pair in each event.
    pub prev_kv: bool,
    /// Replay events from this revision (inclusive). `None` starts at the next write.
    pub start_revision: Option<Revision>,
}

impl WatchRequest {
    /// Watch every key under `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            key: prefix.into(),
            is_prefix: true,
            prev_kv: false,
            start_revision: None,
        }
    }

    /// Watch a single key.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            is_prefix: false,
            ..Self::prefix(key)
        }
    }

    /// Include previous pairs.
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    /// Start from a historical revision.
    pub fn with_start_revision(mut self, revision: Revision) -> Self {
        self.start_revision = Some(revision);
        self
    }
}

/// Kind of mutation carried by a watch event.
///
/// Marked non-exhaustive: backends may learn new kinds, and consumers must map
/// anything they do not recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EventType {
    /// Key created or overwritten.
    Put,
    /// Key deleted (explicitly or by lease expiry).
    Delete,
}

/// One mutation observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Kind of mutation.
    pub event_type: EventType,
    /// Pair after the mutation. For deletes only the key and mod revision are set.
    pub kv: KeyValue,
    /// Pair before the mutation, when requested and known.
    pub prev_kv: Option<KeyValue>,
}

/// Events delivered together by one watch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBatch {
    /// Revision of the last mutation in the batch.
    pub revision: Revision,
    /// Events in store order.
    pub events: Vec<WatchEvent>,
}

/// Ordered stream of watch batches. The stream ends when the server side closes it.
pub type WatchStream = BoxStream<'static, Result<WatchBatch, StoreError>>;
