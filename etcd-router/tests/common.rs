//! Common test utilities

use async_trait::async_trait;
use etcd_router::{
    EtcdConfig, EtcdNode, KvNode, LeaseId, MemoryNode, PutOptions, Result, RouterError,
    StatusCode, TxnRequest, TxnResponse,
};
use mockito::{Server, ServerGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One replica of a store cluster: its own endpoint in front of a store
/// shared with the other replicas, with an on/off switch for outages
#[allow(dead_code)] // Used by other test modules
pub struct Replica {
    endpoint: String,
    store: Arc<MemoryNode>,
    down: AtomicBool,
    calls: AtomicUsize,
}

#[allow(dead_code)] // Used by other test modules
impl Replica {
    pub fn new(endpoint: &str, store: Arc<MemoryNode>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.to_string(),
            store,
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Remote calls that reached this replica, successful or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(RouterError::status(
                &self.endpoint,
                StatusCode::Unavailable,
                "connection refused",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KvNode for Replica {
    fn endpoint(&self, _key: Option<&str>) -> String {
        self.endpoint.clone()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.store.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8], options: PutOptions) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.store.put(key, value, options).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.store.delete(key).await
    }

    async fn txn(&self, key: &str, request: TxnRequest) -> Result<TxnResponse> {
        self.check()?;
        self.store.txn(key, request).await
    }

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId> {
        self.check()?;
        self.store.grant_lease(ttl).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check()?;
        self.store.revoke_lease(lease).await
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<i64> {
        self.check()?;
        self.store.refresh_lease(lease).await
    }
}

/// Replicas of one cluster, all backed by the same store
#[allow(dead_code)] // Used by other test modules
pub fn cluster(endpoints: &[&str]) -> (Arc<MemoryNode>, Vec<Arc<Replica>>) {
    let store = Arc::new(MemoryNode::new("store"));
    let replicas = endpoints
        .iter()
        .map(|e| Replica::new(e, Arc::clone(&store)))
        .collect();
    (store, replicas)
}

/// Erase replica types for router construction
#[allow(dead_code)] // Used by other test modules
pub fn as_pool(replicas: &[Arc<Replica>]) -> Vec<Arc<dyn KvNode>> {
    replicas
        .iter()
        .map(|r| Arc::clone(r) as Arc<dyn KvNode>)
        .collect()
}

/// Independent in-memory nodes, one per endpoint
#[allow(dead_code)] // Used by other test modules
pub fn memory_nodes(endpoints: &[&str]) -> Vec<Arc<dyn KvNode>> {
    endpoints
        .iter()
        .map(|e| Arc::new(MemoryNode::new(*e)) as Arc<dyn KvNode>)
        .collect()
}

/// Create a mock etcd gateway for testing
#[allow(dead_code)] // Used by other test modules
pub async fn create_mock_server() -> ServerGuard {
    Server::new_async().await
}

/// Setup an etcd node pointing to a mock gateway
#[allow(dead_code)] // Used by other test modules
pub async fn setup_test_node() -> (EtcdNode, ServerGuard) {
    let server = create_mock_server().await;
    let config = EtcdConfig::new(server.url()).with_timeout(std::time::Duration::from_secs(5));
    let node = EtcdNode::new(config).unwrap();
    (node, server)
}

/// base64 the way the gateway expects it
#[allow(dead_code)] // Used by other test modules
pub fn b64(data: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}
