//! # etcd-router
//!
//! Client-side failover and sharding in front of etcd-style key-value stores
//!
//! ## Features
//!
//! - 🔁 **Failover**: retry across a pool, quarantine failing nodes, lazy recovery
//! - 🧩 **Sharding**: consistent-hash ring over independent clusters, sticky key cache
//! - 🔒 **Compare-and-swap**: conditional put/delete in a single transaction
//! - ⏳ **Leases**: grant, revoke and keep alive
//! - 🧱 **Composable**: nodes and routers share the [`KvNode`] trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use etcd_router::{KvNode, PutOptions, RouterConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Two endpoints of one cluster: a failover pool
//!     let router = RouterConfig::from_endpoints(["127.0.0.1:2379", "127.0.0.1:22379"])
//!         .connect()?;
//!
//!     router.put("user:1", b"John Doe", PutOptions::new()).await?;
//!     let value = router.get("user:1").await?;
//!     println!("Value: {:?}", value);
//!
//!     // Take a lock only if nobody holds it
//!     let outcome = router.put_if("lock", b"me", None, true).await?;
//!     println!("Locked: {}", outcome.is_applied());
//!
//!     Ok(())
//! }
//! ```

pub mod cas;
pub mod config;
pub mod error;
pub mod etcd;
pub mod failover;
pub mod memory;
pub mod node;
pub mod ring;
pub mod shard;
pub mod types;

pub use cas::{CasAction, CasRequest};
pub use config::{FailoverSettings, NodeSettings, RouterConfig, ShardEntry, ShardSettings};
pub use error::{ErrorKind, Result, RouterError, StatusCode};
pub use etcd::{EtcdConfig, EtcdNode};
pub use failover::{FailoverConfig, FailoverRouter, NodeHealth, NodeState};
pub use memory::MemoryNode;
pub use node::KvNode;
pub use ring::HashRing;
pub use shard::{ShardConfig, ShardRouter};
pub use types::{
    CasOutcome, Compare, CompareOp, CompareTarget, DeleteRangeResponse, KeyValue, LeaseId,
    PutOptions, PutResponse, RangeResponse, RequestOp, ResponseOp, TargetValue, TxnRequest,
    TxnResponse,
};
