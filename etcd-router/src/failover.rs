//! Failover - spread calls over a pool of nodes and route around failures
//!
//! Every remote call picks a node, delegates, and on a transient failure
//! (unreachable, deadline exceeded, empty response) counts the failure
//! against that node and moves on to another one. A node that fails
//! `max_retry` times in a row is quarantined for `holdoff`; it is only taken
//! back when no healthy node is left and its holdoff has run out. Recovery is
//! lazy: there is no background timer.
//!
//! Non-transient errors are correct answers from a healthy node and are
//! returned as-is.

use crate::error::{Result, RouterError};
use crate::node::KvNode;
use crate::types::{LeaseId, PutOptions, TxnRequest, TxnResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failover tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverConfig {
    /// How long a quarantined node is skipped
    pub holdoff: Duration,
    /// Consecutive transient failures before a node is quarantined
    pub max_retry: u32,
    /// Pick a random healthy node per call instead of the first one
    pub balancing: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            holdoff: Duration::from_secs(120),
            max_retry: 3,
            balancing: true,
        }
    }
}

impl FailoverConfig {
    pub fn with_holdoff(mut self, holdoff: Duration) -> Self {
        self.holdoff = holdoff;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_balancing(mut self, balancing: bool) -> Self {
        self.balancing = balancing;
        self
    }

    /// Failure count that quarantines a node (at least 1)
    fn threshold(&self) -> u32 {
        self.max_retry.max(1)
    }
}

/// Health state of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Healthy,
    Quarantined,
}

/// Health record of one node; created on its first failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub consecutive_failures: u32,
    pub state: NodeState,
    /// Set only while quarantined
    pub quarantined_at: Option<Instant>,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            state: NodeState::Healthy,
            quarantined_at: None,
        }
    }
}

/// A pool of interchangeable nodes presented as one
pub struct FailoverRouter {
    /// Pool in registration order
    nodes: Vec<Arc<dyn KvNode>>,
    endpoints: Vec<String>,
    config: FailoverConfig,
    /// Pool index -> health; nodes without a record are healthy
    health: Mutex<HashMap<usize, NodeHealth>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl FailoverRouter {
    /// Create a router over `nodes` with the default configuration
    pub fn new(nodes: Vec<Arc<dyn KvNode>>) -> Result<Self> {
        Self::with_config(nodes, FailoverConfig::default())
    }

    /// Create a router over `nodes`.
    ///
    /// Fails with [`RouterError::InvalidNode`] on an empty pool or when two
    /// nodes report the same endpoint.
    pub fn with_config(nodes: Vec<Arc<dyn KvNode>>, config: FailoverConfig) -> Result<Self> {
        let endpoints = unique_endpoints(&nodes)?;

        Ok(Self {
            nodes,
            endpoints,
            config,
            health: Mutex::new(HashMap::new()),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
        })
    }

    /// Replace the random source used by balancing mode
    pub fn with_rng(self, rng: impl RngCore + Send + 'static) -> Self {
        *self.rng.lock() = Box::new(rng);
        self
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Endpoints in registration order
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Snapshot of the health records, keyed by endpoint
    pub fn health(&self) -> HashMap<String, NodeHealth> {
        self.health
            .lock()
            .iter()
            .map(|(index, record)| (self.endpoints[*index].clone(), record.clone()))
            .collect()
    }

    /// Pick the node for the next attempt, skipping nodes already tried
    /// during this call
    fn select(&self, tried: &HashSet<usize>) -> Option<usize> {
        let mut health = self.health.lock();

        let healthy: Vec<usize> = (0..self.nodes.len())
            .filter(|index| !tried.contains(index))
            .filter(|index| {
                health
                    .get(index)
                    .is_none_or(|record| record.state == NodeState::Healthy)
            })
            .collect();

        if !healthy.is_empty() {
            let index = if self.config.balancing {
                healthy[self.rng.lock().gen_range(0..healthy.len())]
            } else {
                healthy[0]
            };
            return Some(index);
        }

        // Oldest quarantine first
        let mut quarantined: Vec<(Instant, usize)> = health
            .iter()
            .filter(|(index, _)| !tried.contains(index))
            .filter_map(|(index, record)| match record.state {
                NodeState::Quarantined => record.quarantined_at.map(|at| (at, *index)),
                NodeState::Healthy => None,
            })
            .collect();
        quarantined.sort();

        let now = Instant::now();
        let (_, index) = quarantined
            .into_iter()
            .find(|(at, _)| now.duration_since(*at) > self.config.holdoff)?;

        if let Some(record) = health.get_mut(&index) {
            // One more failure puts it straight back
            record.state = NodeState::Healthy;
            record.quarantined_at = None;
            record.consecutive_failures = self.config.threshold() - 1;
        }
        info!(
            "Node {} back in rotation after holdoff of {:?}",
            self.endpoints[index], self.config.holdoff
        );
        Some(index)
    }

    fn record_success(&self, index: usize) {
        if let Some(record) = self.health.lock().get_mut(&index) {
            record.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, index: usize) {
        let mut health = self.health.lock();
        let record = health.entry(index).or_default();
        record.consecutive_failures += 1;

        if record.state == NodeState::Healthy
            && record.consecutive_failures >= self.config.threshold()
        {
            record.state = NodeState::Quarantined;
            record.quarantined_at = Some(Instant::now());
            warn!(
                "Node {} quarantined after {} consecutive failures",
                self.endpoints[index], record.consecutive_failures
            );
        }
    }

    /// Run a remote operation with selection, retry and health tracking.
    /// Each node is tried at most once per call.
    async fn invoke<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn KvNode>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tried = HashSet::new();
        let mut last_error: Option<RouterError> = None;

        loop {
            let Some(index) = self.select(&tried) else {
                let reason = match last_error {
                    Some(e) => format!("{} failed on every usable node, last error: {}", operation, e),
                    None => format!("every node is quarantined, cannot run {}", operation),
                };
                return Err(RouterError::NoNodeAvailable(reason));
            };
            tried.insert(index);

            debug!("Dispatching {} to {}", operation, self.endpoints[index]);
            match call(Arc::clone(&self.nodes[index])).await {
                Ok(value) => {
                    self.record_success(index);
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    warn!("{} failed on {}: {}", operation, self.endpoints[index], e);
                    self.record_failure(index);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Endpoints of `nodes`, rejecting empty pools and duplicates
pub(crate) fn unique_endpoints(nodes: &[Arc<dyn KvNode>]) -> Result<Vec<String>> {
    if nodes.is_empty() {
        return Err(RouterError::InvalidNode("node list is empty".to_string()));
    }

    let mut seen = HashSet::new();
    let mut endpoints = Vec::with_capacity(nodes.len());
    for node in nodes {
        let endpoint = node.endpoint(None);
        if !seen.insert(endpoint.clone()) {
            return Err(RouterError::InvalidNode(format!(
                "duplicate endpoint in node list: {}",
                endpoint
            )));
        }
        endpoints.push(endpoint);
    }
    Ok(endpoints)
}

#[async_trait]
impl KvNode for FailoverRouter {
    /// The pool's endpoints joined with `,`; stable whatever node is healthy
    fn endpoint(&self, _key: Option<&str>) -> String {
        self.endpoints.join(",")
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.invoke("get", |node| async move { node.get(key).await })
            .await
    }

    async fn put(&self, key: &str, value: &[u8], options: PutOptions) -> Result<Option<Vec<u8>>> {
        self.invoke("put", |node| async move { node.put(key, value, options).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.invoke("delete", |node| async move { node.delete(key).await })
            .await
    }

    async fn txn(&self, key: &str, request: TxnRequest) -> Result<TxnResponse> {
        self.invoke("txn", |node| {
            let request = request.clone();
            async move { node.txn(key, request).await }
        })
        .await
    }

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId> {
        self.invoke("grant_lease", |node| async move { node.grant_lease(ttl).await })
            .await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.invoke("revoke_lease", |node| async move {
            node.revoke_lease(lease).await
        })
        .await
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<i64> {
        self.invoke("refresh_lease", |node| async move {
            node.refresh_lease(lease).await
        })
        .await
    }
}
