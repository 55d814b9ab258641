use async_trait::async_trait;

use kestrel_common::api::{Deadline, TxnFinalizeRequest, TxnFinalizeResponse, TxnPushRequest, TxnPushResponse};
use kestrel_common::error::KestrelResult;
use kestrel_common::types::Key;

/// Key-routed access to sibling partitions for the two verbs the core sends
/// outbound: push arbitration at a TRH and finalize at a WI holder.
///
/// Implementations resolve the owning partition from the control plane, fill
/// in the pvid, and handle stale-map refresh. Routing may land back on the
/// calling partition (self-RPC); implementations must not assume otherwise.
#[async_trait]
pub trait PeerRouter: Send + Sync {
    async fn txn_push(
        &self,
        collection: &str,
        routing_key: &Key,
        req: TxnPushRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnPushResponse>;

    async fn txn_finalize(
        &self,
        collection: &str,
        routing_key: &Key,
        req: TxnFinalizeRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnFinalizeResponse>;
}
