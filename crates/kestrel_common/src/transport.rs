use async_trait::async_trait;

use crate::api::{
    Deadline, PushSchemaRequest, PushSchemaResponse, QueryRequest, QueryResponse, ReadRequest,
    ReadResponse, TxnEndRequest, TxnEndResponse, TxnFinalizeRequest, TxnFinalizeResponse,
    TxnHeartbeatRequest, TxnHeartbeatResponse, TxnPushRequest, TxnPushResponse, WriteRequest,
    WriteResponse,
};
use crate::error::KestrelResult;
use crate::types::Timestamp;

/// Verb-level transport to a partition endpoint.
///
/// The partition core and the client both speak through this seam; the
/// in-process implementation lives in the cluster crate. Wire RPC framing is
/// outside this system's scope.
#[async_trait]
pub trait PartitionTransport: Send + Sync {
    async fn read(
        &self,
        endpoint: &str,
        req: ReadRequest,
        deadline: Deadline,
    ) -> KestrelResult<ReadResponse>;

    async fn write(
        &self,
        endpoint: &str,
        req: WriteRequest,
        deadline: Deadline,
    ) -> KestrelResult<WriteResponse>;

    async fn query(
        &self,
        endpoint: &str,
        req: QueryRequest,
        deadline: Deadline,
    ) -> KestrelResult<QueryResponse>;

    async fn txn_push(
        &self,
        endpoint: &str,
        req: TxnPushRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnPushResponse>;

    async fn txn_end(
        &self,
        endpoint: &str,
        req: TxnEndRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnEndResponse>;

    async fn txn_heartbeat(
        &self,
        endpoint: &str,
        req: TxnHeartbeatRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnHeartbeatResponse>;

    async fn txn_finalize(
        &self,
        endpoint: &str,
        req: TxnFinalizeRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnFinalizeResponse>;

    async fn push_schema(
        &self,
        endpoint: &str,
        req: PushSchemaRequest,
        deadline: Deadline,
    ) -> KestrelResult<PushSchemaResponse>;
}

/// Source of TSO timestamps, as seen by the partition core (retention
/// refresh) and by transaction begin.
#[async_trait]
pub trait TimestampSource: Send + Sync {
    async fn now_timestamp(&self) -> KestrelResult<Timestamp>;
}
