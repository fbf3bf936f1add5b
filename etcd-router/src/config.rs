//! YAML configuration and router assembly

use crate::error::{Result, RouterError};
use crate::etcd::{EtcdConfig, EtcdNode};
use crate::failover::{FailoverConfig, FailoverRouter};
use crate::node::KvNode;
use crate::ring::DEFAULT_REPLICAS;
use crate::shard::{ShardConfig, ShardRouter};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Router configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub failover: FailoverSettings,
    pub shard: ShardSettings,
    pub node: NodeSettings,
    /// One entry per independent store cluster
    pub shards: Vec<ShardEntry>,
}

/// Failover knobs applied to every multi-endpoint shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    /// Quarantine holdoff (seconds)
    pub holdoff_secs: u64,
    /// Consecutive failures before quarantine
    pub max_retry: u32,
    /// Random selection among healthy nodes
    pub balancing: bool,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            holdoff_secs: 120,
            max_retry: 3,
            balancing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardSettings {
    /// Virtual points per shard on the ring
    pub replicas: usize,
    /// Route `{tag}` keys by their tag only
    pub hash_tags: bool,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            replicas: DEFAULT_REPLICAS,
            hash_tags: false,
        }
    }
}

/// Transport settings for every etcd node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Request timeout (milliseconds)
    pub timeout_ms: u64,
    pub auth_token: Option<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            auth_token: None,
        }
    }
}

/// Endpoints of one store cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub endpoints: Vec<String>,
}

impl RouterConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: RouterConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// A single shard over `endpoints`, everything else default
    pub fn from_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shards: vec![ShardEntry {
                endpoints: endpoints.into_iter().map(Into::into).collect(),
            }],
            ..Self::default()
        }
    }

    /// Get holdoff as Duration
    pub fn holdoff(&self) -> Duration {
        Duration::from_secs(self.failover.holdoff_secs)
    }

    /// Get node timeout as Duration
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node.timeout_ms)
    }

    pub fn failover_config(&self) -> FailoverConfig {
        FailoverConfig::default()
            .with_holdoff(self.holdoff())
            .with_max_retry(self.failover.max_retry)
            .with_balancing(self.failover.balancing)
    }

    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig::default()
            .with_replicas(self.shard.replicas)
            .with_hash_tags(self.shard.hash_tags)
    }

    pub fn etcd_config(&self, endpoint: &str) -> EtcdConfig {
        let config = EtcdConfig::new(endpoint).with_timeout(self.node_timeout());
        match &self.node.auth_token {
            Some(token) => config.with_auth_token(token.clone()),
            None => config,
        }
    }

    /// Check the configuration before any node is created
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(RouterError::ConfigError("no shards configured".to_string()));
        }
        if self.shard.replicas == 0 {
            return Err(RouterError::ConfigError(
                "shard.replicas must be at least 1".to_string(),
            ));
        }
        if self.node.timeout_ms == 0 {
            return Err(RouterError::ConfigError(
                "node.timeout_ms must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (index, shard) in self.shards.iter().enumerate() {
            if shard.endpoints.is_empty() {
                return Err(RouterError::ConfigError(format!(
                    "shard {} has no endpoints",
                    index
                )));
            }
            for endpoint in &shard.endpoints {
                if endpoint.trim().is_empty() {
                    return Err(RouterError::ConfigError(format!(
                        "shard {} has an empty endpoint",
                        index
                    )));
                }
                if !seen.insert(endpoint.as_str()) {
                    return Err(RouterError::ConfigError(format!(
                        "endpoint {} is listed more than once",
                        endpoint
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the router described by this configuration.
    ///
    /// One endpoint gives a bare [`EtcdNode`], a multi-endpoint shard a
    /// [`FailoverRouter`], and several shards a [`ShardRouter`] over those.
    pub fn connect(&self) -> Result<Arc<dyn KvNode>> {
        self.validate()?;

        let mut shards = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            shards.push(self.connect_shard(shard)?);
        }

        if shards.len() == 1 {
            return Ok(shards.remove(0));
        }

        info!("Sharding over {} clusters", shards.len());
        let router = ShardRouter::with_config(shards, self.shard_config())?;
        Ok(Arc::new(router))
    }

    fn connect_shard(&self, shard: &ShardEntry) -> Result<Arc<dyn KvNode>> {
        let mut nodes: Vec<Arc<dyn KvNode>> = Vec::with_capacity(shard.endpoints.len());
        for endpoint in &shard.endpoints {
            nodes.push(Arc::new(EtcdNode::new(self.etcd_config(endpoint))?));
        }

        if nodes.len() == 1 {
            return Ok(nodes.remove(0));
        }

        info!("Failover pool over {}", shard.endpoints.join(","));
        let router = FailoverRouter::with_config(nodes, self.failover_config())?;
        Ok(Arc::new(router))
    }
}
