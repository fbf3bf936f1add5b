//! The capability shared by single nodes and routers

use crate::cas::{self, CasRequest};
use crate::error::Result;
use crate::types::{
    CasOutcome, Compare, CompareOp, CompareTarget, LeaseId, PutOptions, RequestOp, TxnRequest,
    TxnResponse,
};
use async_trait::async_trait;

/// Key-value operations against one store node or a pool of them.
///
/// Single nodes ([`EtcdNode`](crate::EtcdNode), [`MemoryNode`](crate::MemoryNode))
/// and routers ([`FailoverRouter`](crate::FailoverRouter),
/// [`ShardRouter`](crate::ShardRouter)) all implement it, so routers can be
/// stacked: a shard router over per-shard failover routers over etcd nodes.
///
/// Required methods contact a remote node. Provided methods are local: they
/// build or decode requests and never go through node selection or retry.
/// Conditional writes are provided on top of [`KvNode::txn`], so a router
/// that retries `txn` retries them too.
#[async_trait]
pub trait KvNode: Send + Sync {
    /// Identity of the node answering for `key`. Without a key, the identity
    /// of this node or pool as a whole.
    fn endpoint(&self, key: Option<&str>) -> String;

    /// Value stored at `key`, `None` if the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` at `key`. Returns the previous value when
    /// `options.prev_kv` is set and the key existed.
    async fn put(&self, key: &str, value: &[u8], options: PutOptions)
    -> Result<Option<Vec<u8>>>;

    /// Remove `key`; `true` if something was deleted
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Run a raw transaction. `key` only selects the node; the transaction
    /// itself may touch other keys.
    async fn txn(&self, key: &str, request: TxnRequest) -> Result<TxnResponse>;

    /// Grant a lease living `ttl` seconds
    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Keep a lease alive; returns its new TTL in seconds
    async fn refresh_lease(&self, lease: LeaseId) -> Result<i64>;

    /// Put `value` if `key` holds `expected` (`None`: if `key` does not exist)
    async fn put_if(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<&[u8]>,
        return_current: bool,
    ) -> Result<CasOutcome> {
        let request = CasRequest::put_if(key, value, expected).return_current(return_current);
        self.cas(&request).await
    }

    /// Delete `key` if it holds `expected` (`None`: if `key` does not exist)
    async fn delete_if(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        return_current: bool,
    ) -> Result<CasOutcome> {
        let request = CasRequest::delete_if(key, expected).return_current(return_current);
        self.cas(&request).await
    }

    /// Execute a prepared conditional write in one round trip
    async fn cas(&self, request: &CasRequest) -> Result<CasOutcome> {
        let txn = request.to_txn()?;
        let response = self.txn(request.key(), txn).await?;
        request.outcome(&response)
    }

    fn compare(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        op: CompareOp,
        target: CompareTarget,
    ) -> Result<Compare> {
        cas::compare(key, expected, op, target)
    }

    fn put_operation(&self, key: &str, value: &[u8], lease: LeaseId) -> RequestOp {
        cas::put_operation(key, value, lease)
    }

    fn delete_operation(&self, key: &str) -> RequestOp {
        cas::delete_operation(key)
    }

    fn get_operation(&self, key: &str) -> RequestOp {
        cas::get_operation(key)
    }
}
