//! Sharding - route every key to one member of a fixed pool
//!
//! Keys are placed with a consistent-hash ring built once, on first use,
//! from the pool's endpoints. Every resolved key is memoized for the life of
//! the router, so a key keeps going to the same member. The pool is fixed at
//! construction.
//!
//! The router never retries; put a [`FailoverRouter`](crate::FailoverRouter)
//! in the pool for each shard that should fail over.

use crate::error::{Result, RouterError};
use crate::failover::unique_endpoints;
use crate::node::KvNode;
use crate::ring::{DEFAULT_REPLICAS, HashRing, extract_hash_tag};
use crate::types::{CasOutcome, LeaseId, PutOptions, TxnRequest, TxnResponse};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Sharding configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConfig {
    /// Virtual points per pool member on the ring
    pub replicas: usize,
    /// Hash only the `{tag}` part of keys that carry one
    pub hash_tags: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            replicas: DEFAULT_REPLICAS,
            hash_tags: false,
        }
    }
}

impl ShardConfig {
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_hash_tags(mut self, enabled: bool) -> Self {
        self.hash_tags = enabled;
        self
    }
}

/// Consistent-hash router over a fixed pool
pub struct ShardRouter {
    nodes: Vec<Arc<dyn KvNode>>,
    endpoints: Vec<String>,
    config: ShardConfig,
    ring: OnceLock<HashRing>,
    /// key -> pool index, never evicted
    key_cache: RwLock<HashMap<String, usize>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl ShardRouter {
    pub fn new(nodes: Vec<Arc<dyn KvNode>>) -> Result<Self> {
        Self::with_config(nodes, ShardConfig::default())
    }

    /// Create a router over `nodes`.
    ///
    /// Fails with [`RouterError::InvalidNode`] on an empty pool or duplicate
    /// endpoints, and with [`RouterError::ConfigError`] for zero replicas.
    pub fn with_config(nodes: Vec<Arc<dyn KvNode>>, config: ShardConfig) -> Result<Self> {
        if config.replicas == 0 {
            return Err(RouterError::ConfigError(
                "shard ring needs at least one replica per node".to_string(),
            ));
        }
        let endpoints = unique_endpoints(&nodes)?;

        Ok(Self {
            nodes,
            endpoints,
            config,
            ring: OnceLock::new(),
            key_cache: RwLock::new(HashMap::new()),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
        })
    }

    /// Replace the random source used for key-less operations
    pub fn with_rng(self, rng: impl RngCore + Send + 'static) -> Self {
        *self.rng.lock() = Box::new(rng);
        self
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// Endpoints in registration order
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Endpoint of the pool member owning `key`
    pub fn resolve(&self, key: &str) -> String {
        self.endpoints[self.resolve_index(key)].clone()
    }

    /// Endpoint `key` was memoized to, if it has been resolved before
    pub fn cached_endpoint(&self, key: &str) -> Option<String> {
        self.key_cache
            .read()
            .get(key)
            .map(|index| self.endpoints[*index].clone())
    }

    /// Whether the ring has been built yet
    pub fn ring_built(&self) -> bool {
        self.ring.get().is_some()
    }

    /// Forget every memoized key
    pub fn clear_cache(&self) {
        self.key_cache.write().clear();
    }

    fn ring(&self) -> &HashRing {
        self.ring.get_or_init(|| {
            let ring = HashRing::new(&self.endpoints, self.config.replicas);
            info!(
                "Built shard ring over {} nodes ({} points)",
                self.endpoints.len(),
                ring.len()
            );
            ring
        })
    }

    fn resolve_index(&self, key: &str) -> usize {
        if let Some(index) = self.key_cache.read().get(key) {
            return *index;
        }

        let hashed = if self.config.hash_tags {
            extract_hash_tag(key).unwrap_or(key)
        } else {
            key
        };
        // The pool is never empty, so neither is the ring
        let index = self.ring().lookup(hashed).unwrap_or(0);
        debug!("Key {} resolved to {}", key, self.endpoints[index]);

        *self.key_cache.write().entry(key.to_string()).or_insert(index)
    }

    fn node_for(&self, key: &str) -> &Arc<dyn KvNode> {
        &self.nodes[self.resolve_index(key)]
    }

    /// Any pool member, for operations that carry no key
    fn random_node(&self) -> &Arc<dyn KvNode> {
        let index = self.rng.lock().gen_range(0..self.nodes.len());
        &self.nodes[index]
    }
}

#[async_trait]
impl KvNode for ShardRouter {
    /// With a key, the identity reported by the owning member; without one,
    /// every endpoint joined with `-`
    fn endpoint(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => self.node_for(key).endpoint(Some(key)),
            None => self.endpoints.join("-"),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.node_for(key).get(key).await
    }

    async fn put(&self, key: &str, value: &[u8], options: PutOptions) -> Result<Option<Vec<u8>>> {
        self.node_for(key).put(key, value, options).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.node_for(key).delete(key).await
    }

    async fn put_if(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<&[u8]>,
        return_current: bool,
    ) -> Result<CasOutcome> {
        self.node_for(key)
            .put_if(key, value, expected, return_current)
            .await
    }

    async fn delete_if(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        return_current: bool,
    ) -> Result<CasOutcome> {
        self.node_for(key)
            .delete_if(key, expected, return_current)
            .await
    }

    async fn txn(&self, key: &str, request: TxnRequest) -> Result<TxnResponse> {
        self.node_for(key).txn(key, request).await
    }

    // Leases carry no key: any member will do, and lease state is per member
    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId> {
        self.random_node().grant_lease(ttl).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.random_node().revoke_lease(lease).await
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<i64> {
        self.random_node().refresh_lease(lease).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNode;

    fn memory_pool(endpoints: &[&str]) -> Vec<Arc<dyn KvNode>> {
        endpoints
            .iter()
            .map(|e| Arc::new(MemoryNode::new(*e)) as Arc<dyn KvNode>)
            .collect()
    }

    #[test]
    fn test_rejects_bad_pools() {
        assert!(matches!(
            ShardRouter::new(Vec::new()),
            Err(RouterError::InvalidNode(_))
        ));
        assert!(matches!(
            ShardRouter::new(memory_pool(&["a", "a"])),
            Err(RouterError::InvalidNode(_))
        ));
        assert!(matches!(
            ShardRouter::with_config(memory_pool(&["a"]), ShardConfig::default().with_replicas(0)),
            Err(RouterError::ConfigError(_))
        ));
    }

    #[test]
    fn test_ring_is_built_lazily() {
        let router = ShardRouter::new(memory_pool(&["a", "b", "c"])).unwrap();
        assert!(!router.ring_built());
        router.resolve("x");
        assert!(router.ring_built());
    }

    #[test]
    fn test_resolve_matches_ring() {
        let endpoints = ["a:2379", "b:2379", "c:2379"];
        let router = ShardRouter::new(memory_pool(&endpoints)).unwrap();
        let ring = HashRing::new(&endpoints, DEFAULT_REPLICAS);

        for i in 0..200 {
            let key = format!("key:{}", i);
            let expected = endpoints[ring.lookup(&key).unwrap()];
            assert_eq!(router.resolve(&key), expected);
        }
    }

    #[test]
    fn test_resolve_is_cached() {
        let router = ShardRouter::new(memory_pool(&["a", "b", "c"])).unwrap();
        assert_eq!(router.cached_endpoint("user:1"), None);

        let first = router.resolve("user:1");
        assert_eq!(router.cached_endpoint("user:1"), Some(first.clone()));
        assert_eq!(router.resolve("user:1"), first);

        router.clear_cache();
        assert_eq!(router.cached_endpoint("user:1"), None);
        assert_eq!(router.resolve("user:1"), first);
    }

    #[test]
    fn test_hash_tags_colocate_keys() {
        let config = ShardConfig::default().with_hash_tags(true);
        let router = ShardRouter::with_config(memory_pool(&["a", "b", "c", "d"]), config).unwrap();

        for i in 0..50 {
            let profile = format!("user:{{{}}}:profile", i);
            let settings = format!("user:{{{}}}:settings", i);
            assert_eq!(router.resolve(&profile), router.resolve(&settings));
        }
    }

    #[test]
    fn test_endpoint_identity() {
        let router = ShardRouter::new(memory_pool(&["a", "b", "c"])).unwrap();
        assert_eq!(router.endpoint(None), "a-b-c");
        let owner = router.resolve("k");
        assert_eq!(router.endpoint(Some("k")), owner);
    }

    #[tokio::test]
    async fn test_operations_land_on_owner() {
        let nodes: Vec<Arc<MemoryNode>> = ["a", "b", "c"]
            .iter()
            .map(|e| Arc::new(MemoryNode::new(*e)))
            .collect();
        let pool: Vec<Arc<dyn KvNode>> = nodes
            .iter()
            .map(|n| Arc::clone(n) as Arc<dyn KvNode>)
            .collect();
        let router = ShardRouter::new(pool).unwrap();

        for i in 0..30 {
            let key = format!("key:{}", i);
            router
                .put(&key, key.as_bytes(), PutOptions::new())
                .await
                .unwrap();
        }

        for i in 0..30 {
            let key = format!("key:{}", i);
            let owner = router.resolve(&key);
            for node in &nodes {
                let stored = node.get(&key).await.unwrap();
                if node.endpoint(None) == owner {
                    assert_eq!(stored, Some(key.as_bytes().to_vec()));
                } else {
                    assert_eq!(stored, None);
                }
            }
        }
    }
}
