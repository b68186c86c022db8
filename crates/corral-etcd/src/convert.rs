//! Translation between corral request types and `etcd-client` types.

use corral_core::Compare;
use corral_core::CompareOp;
use corral_core::CompareTarget;
use corral_core::DeleteRequest;
use corral_core::DeleteResult;
use corral_core::KeyValue;
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
use etcd_client::DeleteOptions;
use etcd_client::GetOptions;
use etcd_client::PutOptions;
use etcd_client::ResponseHeader;
use etcd_client::Txn;
use etcd_client::TxnOpResponse;
use tonic::Code;

/// Map an `etcd-client` error onto [`StoreError`].
pub fn map_error(err: etcd_client::Error) -> StoreError {
    match err {
        etcd_client::Error::GRpcStatus(status) => map_status(&status),
        etcd_client::Error::TransportError(err) => StoreError::Connection { reason: err.to_string() },
        etcd_client::Error::IoError(err) => StoreError::Connection { reason: err.to_string() },
        etcd_client::Error::InvalidArgs(reason) => StoreError::InvalidRequest { reason },
        other => StoreError::Failed {
            reason: other.to_string(),
        },
    }
}

fn map_status(status: &tonic::Status) -> StoreError {
    let message = status.message();
    match status.code() {
        Code::Unavailable | Code::Aborted => StoreError::Connection {
            reason: message.to_string(),
        },
        Code::DeadlineExceeded => StoreError::Timeout { duration_ms: 0 },
        Code::NotFound if message.contains("lease not found") => StoreError::LeaseNotFound { lease_id: 0 },
        Code::OutOfRange if message.contains("compacted") => StoreError::Compacted { revision: 0 },
        Code::InvalidArgument | Code::FailedPrecondition => StoreError::InvalidRequest {
            reason: message.to_string(),
        },
        _ => StoreError::Failed {
            reason: format!("{}: {message}", status.code()),
        },
    }
}

pub(crate) fn header_revision(header: Option<&ResponseHeader>) -> Revision {
    header.map(|h| h.revision()).unwrap_or_default()
}

pub(crate) fn key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: String::from_utf8_lossy(kv.value()).into_owned(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: kv.lease(),
    }
}

pub(crate) fn get_options(request: &RangeRequest) -> GetOptions {
    let mut options = GetOptions::new();
    if request.is_prefix {
        options = options.with_prefix();
    }
    if let Some(limit) = request.limit {
        options = options.with_limit(i64::from(limit));
    }
    if request.sort_order != SortOrder::None || request.sort_target != SortTarget::Key {
        let target = match request.sort_target {
            SortTarget::Key => etcd_client::SortTarget::Key,
            SortTarget::CreateRevision => etcd_client::SortTarget::Create,
            SortTarget::ModRevision => etcd_client::SortTarget::Mod,
        };
        let order = match request.sort_order {
            SortOrder::Descend => etcd_client::SortOrder::Descend,
            SortOrder::None | SortOrder::Ascend => etcd_client::SortOrder::Ascend,
        };
        options = options.with_sort(target, order);
    }
    if request.count_only {
        options = options.with_count_only();
    }
    options
}

pub(crate) fn put_options(request: &PutRequest) -> PutOptions {
    let mut options = PutOptions::new();
    if let Some(lease) = request.lease {
        options = options.with_lease(lease);
    }
    if request.prev_kv {
        options = options.with_prev_key();
    }
    options
}

pub(crate) fn delete_options(request: &DeleteRequest) -> DeleteOptions {
    let mut options = DeleteOptions::new();
    if request.is_prefix {
        options = options.with_prefix();
    }
    if request.prev_kv {
        options = options.with_prev_key();
    }
    options
}

pub(crate) fn range_result(response: &etcd_client::GetResponse) -> RangeResult {
    RangeResult {
        kvs: response.kvs().iter().map(key_value).collect(),
        more: response.more(),
        count: u64::try_from(response.count()).unwrap_or_default(),
        revision: header_revision(response.header()),
    }
}

pub(crate) fn put_result(response: &etcd_client::PutResponse) -> PutResult {
    PutResult {
        revision: header_revision(response.header()),
        prev_kv: response.prev_key().map(key_value),
    }
}

pub(crate) fn delete_result(response: &etcd_client::DeleteResponse) -> DeleteResult {
    DeleteResult {
        deleted: u64::try_from(response.deleted()).unwrap_or_default(),
        revision: header_revision(response.header()),
        prev_kvs: response.prev_kvs().iter().map(key_value).collect(),
    }
}

fn compare(compare: &Compare) -> etcd_client::Compare {
    let op = match compare.op {
        CompareOp::Equal => etcd_client::CompareOp::Equal,
        CompareOp::NotEqual => etcd_client::CompareOp::NotEqual,
        CompareOp::Greater => etcd_client::CompareOp::Greater,
        CompareOp::Less => etcd_client::CompareOp::Less,
    };
    let key = compare.key.as_str();
    match &compare.target {
        CompareTarget::CreateRevision(revision) => etcd_client::Compare::create_revision(key, op, *revision),
        CompareTarget::ModRevision(revision) => etcd_client::Compare::mod_revision(key, op, *revision),
        CompareTarget::Version(version) => etcd_client::Compare::version(key, op, *version),
        CompareTarget::Value(value) => etcd_client::Compare::value(key, op, value.as_str()),
    }
}

fn txn_op(op: &TxnOp) -> etcd_client::TxnOp {
    match op {
        TxnOp::Put(put) => etcd_client::TxnOp::put(put.key.as_str(), put.value.as_str(), Some(put_options(put))),
        TxnOp::Delete(delete) => etcd_client::TxnOp::delete(delete.key.as_str(), Some(delete_options(delete))),
        TxnOp::Range(range) => etcd_client::TxnOp::get(range.key.as_str(), Some(get_options(range))),
    }
}

pub(crate) fn txn(request: &TxnRequest) -> Txn {
    Txn::new()
        .when(request.compare.iter().map(compare).collect::<Vec<_>>())
        .and_then(request.success.iter().map(txn_op).collect::<Vec<_>>())
        .or_else(request.failure.iter().map(txn_op).collect::<Vec<_>>())
}

pub(crate) fn txn_result(response: &etcd_client::TxnResponse) -> TxnResult {
    let responses = response
        .op_responses()
        .iter()
        .filter_map(|op| match op {
            TxnOpResponse::Put(put) => Some(TxnOpResult::Put(put_result(put))),
            TxnOpResponse::Delete(delete) => Some(TxnOpResult::Delete(delete_result(delete))),
            TxnOpResponse::Get(get) => Some(TxnOpResult::Range(range_result(get))),
            // Nested transactions are never issued.
            TxnOpResponse::Txn(_) => None,
        })
        .collect();
    TxnResult {
        succeeded: response.succeeded(),
        revision: header_revision(response.header()),
        responses,
    }
}
