//! Request and response types for key-value, range and transaction operations.
//!
//! The shapes follow the etcd v3 data model: every mutation is stamped with a
//! cluster-wide revision, and each key carries the revision that created it, the
//! revision that last modified it, and a per-key version counter.

use serde::Deserialize;
use serde::Serialize;

/// Cluster-wide revision assigned to every mutation.
pub type Revision = i64;

/// Identifier of a lease granted by the store. Zero means "no lease".
pub type LeaseId = i64;

/// A stored key with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key.
    pub key: String,
    /// The value.
    pub value: String,
    /// Revision of the mutation that created the key.
    pub create_revision: Revision,
    /// Revision of the last mutation of the key.
    pub mod_revision: Revision,
    /// Number of writes since creation (1 after the first put).
    pub version: i64,
    /// Lease the key is attached to, or 0.
    pub lease: LeaseId,
}

/// Which field a range result is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortTarget {
    /// Lexicographic key order.
    #[default]
    Key,
    /// Creation revision.
    CreateRevision,
    /// Last modification revision.
    ModRevision,
}

/// Direction of a sorted range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Store order (key ascending).
    #[default]
    None,
    /// Ascending.
    Ascend,
    /// Descending.
    Descend,
}

/// Range read over a single key or a key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    /// Exact key, or the prefix when `is_prefix` is set.
    pub key: String,
    /// Match every key starting with `key`.
    pub is_prefix: bool,
    /// Maximum number of entries returned. `None` returns everything.
    pub limit: Option<u32>,
    /// Field the results are sorted by.
    pub sort_target: SortTarget,
    /// Sort direction.
    pub sort_order: SortOrder,
    /// Only report `count`, return no entries.
    pub count_only: bool,
}

impl RangeRequest {
    /// Read a single key.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_prefix: false,
            limit: None,
            sort_target: SortTarget::Key,
            sort_order: SortOrder::None,
            count_only: false,
        }
    }

    /// Read every key under `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            is_prefix: true,
            ..Self::key(prefix)
        }
    }

    /// Cap the number of returned entries.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sort the results.
    pub fn sorted_by(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.sort_target = target;
        self.sort_order = order;
        self
    }

    /// Return only the number of matching keys.
    pub fn count_only(mut self) -> Self {
        self.count_only = true;
        self
    }
}

/// Result of a range read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    /// Matching entries, after sorting and limiting.
    pub kvs: Vec<KeyValue>,
    /// True if more entries matched than were returned.
    pub more: bool,
    /// Total number of matching keys, before the limit.
    pub count: u64,
    /// Store revision the read was served at.
    pub revision: Revision,
}

/// Write a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    /// Key to write.
    pub key: String,
    /// Value to write.
    pub value: String,
    /// Attach the key to this lease.
    pub lease: Option<LeaseId>,
    /// Return the previous key-value pair.
    pub prev_kv: bool,
}

impl PutRequest {
    /// Create a put without lease.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            lease: None,
            prev_kv: false,
        }
    }

    /// Attach the key to a lease.
    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Ask for the previous key-value pair.
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

/// Result of a put.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResult {
    /// Revision of the write.
    pub revision: Revision,
    /// Previous pair, if requested and present.
    pub prev_kv: Option<KeyValue>,
}

/// Delete a single key or every key under a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Exact key, or the prefix when `is_prefix` is set.
    pub key: String,
    /// Delete every key starting with `key`.
    pub is_prefix: bool,
    /// Return the deleted pairs.
    pub prev_kv: bool,
}

impl DeleteRequest {
    /// Delete one key.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_prefix: false,
            prev_kv: false,
        }
    }

    /// Delete every key under `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            is_prefix: true,
            ..Self::key(prefix)
        }
    }

    /// Ask for the deleted pairs.
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

/// Result of a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResult {
    /// Number of keys removed.
    pub deleted: u64,
    /// Revision after the delete.
    pub revision: Revision,
    /// Removed pairs, if requested.
    pub prev_kvs: Vec<KeyValue>,
}

/// Comparison operator used in transaction guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `>`
    Greater,
    /// `<`
    Less,
}

impl CompareOp {
    /// Apply the operator to two ordered values.
    pub fn holds<T: PartialOrd + ?Sized>(self, actual: &T, expected: &T) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }
}

/// Field compared by a transaction guard, with the expected value.
///
/// Revision and version targets of a missing key compare as 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareTarget {
    /// Creation revision.
    CreateRevision(Revision),
    /// Last modification revision.
    ModRevision(Revision),
    /// Per-key version.
    Version(i64),
    /// Current value. Never matches a missing key.
    Value(String),
}

/// A single transaction guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compare {
    /// Key under test.
    pub key: String,
    /// Compared field and expected value.
    pub target: CompareTarget,
    /// Operator.
    pub op: CompareOp,
}

impl Compare {
    /// Guard on the creation revision of `key`.
    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::CreateRevision(revision),
            op,
        }
    }

    /// Guard on the last modification revision of `key`.
    pub fn mod_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::ModRevision(revision),
            op,
        }
    }

    /// Guard on the version of `key`.
    pub fn version(key: impl Into<String>, op: CompareOp, version: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Version(version),
            op,
        }
    }

    /// Guard on the value of `key`.
    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Value(value.into()),
            op,
        }
    }
}

/// Operation executed in a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOp {
    /// Write a key.
    Put(PutRequest),
    /// Delete a key or prefix.
    Delete(DeleteRequest),
    /// Read a key or prefix.
    Range(RangeRequest),
}

/// Conditional multi-operation transaction.
///
/// All guards must hold for `success` to run; otherwise `failure` runs. Every
/// write in the executed branch shares a single revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRequest {
    /// Guards, combined with AND.
    pub compare: Vec<Compare>,
    /// Operations run when every guard holds.
    pub success: Vec<TxnOp>,
    /// Operations run otherwise.
    pub failure: Vec<TxnOp>,
}

impl TxnRequest {
    /// Empty transaction (no guards, always succeeds).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guards.
    pub fn when(mut self, compare: Vec<Compare>) -> Self {
        self.compare = compare;
        self
    }

    /// Set the success branch.
    pub fn and_then(mut self, ops: Vec<TxnOp>) -> Self {
        self.success = ops;
        self
    }

    /// Set the failure branch.
    pub fn or_else(mut self, ops: Vec<TxnOp>) -> Self {
        self.failure = ops;
        self
    }
}

/// Result of one operation of the executed branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResult {
    /// Result of a put.
    Put(PutResult),
    /// Result of a delete.
    Delete(DeleteResult),
    /// Result of a range.
    Range(RangeResult),
}

/// Result of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResult {
    /// True if the guards held and the success branch ran.
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: Revision,
    /// One entry per operation of the executed branch, in order.
    pub responses: Vec<TxnOpResult>,
}

impl TxnResult {
    /// First range result of the executed branch, if any.
    pub fn first_range(&self) -> Option<&RangeResult> {
        self.responses.iter().find_map(|response| match response {
            TxnOpResult::Range(range) => Some(range),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_builders_compose() {
        let request = RangeRequest::prefix("/queue/")
            .with_limit(8)
            .sorted_by(SortTarget::CreateRevision, SortOrder::Descend);
        assert!(request.is_prefix);
        assert_eq!(request.limit, Some(8));
        assert_eq!(request.sort_target, SortTarget::CreateRevision);
        assert_eq!(request.sort_order, SortOrder::Descend);
        assert!(!request.count_only);
    }

    #[test]
    fn compare_op_orders_values() {
        assert!(CompareOp::Equal.holds(&3, &3));
        assert!(CompareOp::NotEqual.holds(&3, &4));
        assert!(CompareOp::Greater.holds(&5, &4));
        assert!(CompareOp::Less.holds("a", "b"));
        assert!(!CompareOp::Less.holds(&4, &4));
    }

    #[test]
    fn txn_result_finds_first_range() {
        let result = TxnResult {
            succeeded: false,
            revision: 7,
            responses: vec![
                TxnOpResult::Put(PutResult::default()),
                TxnOpResult::Range(RangeResult {
                    count: 2,
                    ..Default::default()
                }),
            ],
        };
        assert_eq!(result.first_range().map(|range| range.count), Some(2));
    }
}
