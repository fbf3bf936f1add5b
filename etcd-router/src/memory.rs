//! In-process store node
//!
//! Keeps etcd's revision bookkeeping (global revision, per-key create/mod
//! revision and version) and lease attachment, so conditional writes behave
//! as they would against a real member. Leases expire lazily: expired leases
//! and their keys are dropped at the start of the next operation.

use crate::error::{Result, RouterError, StatusCode};
use crate::node::KvNode;
use crate::types::{
    Compare, DeleteRangeResponse, KeyValue, LeaseId, PutOptions, PutResponse, RangeResponse,
    RequestOp, ResponseOp, TargetValue, TxnRequest, TxnResponse,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct Lease {
    ttl: i64,
    expires_at: Instant,
    keys: BTreeSet<String>,
}

#[derive(Default)]
struct MemoryState {
    revision: i64,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

/// A single store node held in memory
pub struct MemoryNode {
    endpoint: String,
    state: Mutex<MemoryState>,
}

impl MemoryNode {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Full record for `key`, including revision metadata
    pub fn key_value(&self, key: &str) -> Option<KeyValue> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        state.kvs.get(key).cloned()
    }

    fn not_found(&self, message: impl Into<String>) -> RouterError {
        RouterError::status(&self.endpoint, StatusCode::NotFound, message)
    }

    fn invalid(&self, message: impl Into<String>) -> RouterError {
        RouterError::status(&self.endpoint, StatusCode::InvalidArgument, message)
    }
}

impl MemoryState {
    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!("Lease {} expired", id);
            self.drop_lease(id);
        }
    }

    /// Remove a lease and every key attached to it
    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let attached: Vec<String> = lease
            .keys
            .into_iter()
            .filter(|key| self.kvs.contains_key(key))
            .collect();
        if !attached.is_empty() {
            self.revision += 1;
            for key in attached {
                self.kvs.remove(&key);
            }
        }
        true
    }

    fn range(&self, key: &str) -> RangeResponse {
        let kvs: Vec<KeyValue> = self.kvs.get(key).cloned().into_iter().collect();
        RangeResponse {
            count: kvs.len() as i64,
            kvs,
        }
    }

    /// Apply a put at `revision` without bumping the store revision
    fn put_at(
        &mut self,
        revision: i64,
        key: &str,
        value: &[u8],
        options: PutOptions,
    ) -> std::result::Result<PutResponse, (StatusCode, String)> {
        let previous = self.kvs.get(key).cloned();

        if (options.ignore_value || options.ignore_lease) && previous.is_none() {
            return Err((StatusCode::InvalidArgument, "key not found".to_string()));
        }

        let lease = match &previous {
            Some(prev) if options.ignore_lease => prev.lease,
            _ => options.lease,
        };
        if lease != 0 && !self.leases.contains_key(&lease) {
            return Err((StatusCode::NotFound, "requested lease not found".to_string()));
        }

        let value = match &previous {
            Some(prev) if options.ignore_value => prev.value.clone(),
            _ => value.to_vec(),
        };

        let (create_revision, version) = match &previous {
            Some(prev) => (prev.create_revision, prev.version + 1),
            None => (revision, 1),
        };

        if let Some(prev) = previous.as_ref().filter(|prev| prev.lease != lease) {
            if let Some(old) = self.leases.get_mut(&prev.lease) {
                old.keys.remove(key);
            }
        }
        if let Some(attached) = self.leases.get_mut(&lease) {
            attached.keys.insert(key.to_string());
        }

        self.kvs.insert(
            key.to_string(),
            KeyValue {
                key: key.as_bytes().to_vec(),
                value,
                create_revision,
                mod_revision: revision,
                version,
                lease,
            },
        );

        Ok(PutResponse {
            prev_kv: if options.prev_kv { previous } else { None },
        })
    }

    fn delete_at(&mut self, key: &str) -> DeleteRangeResponse {
        match self.kvs.remove(key) {
            Some(removed) => {
                if let Some(lease) = self.leases.get_mut(&removed.lease) {
                    lease.keys.remove(key);
                }
                DeleteRangeResponse { deleted: 1 }
            }
            None => DeleteRangeResponse { deleted: 0 },
        }
    }

    fn evaluate(&self, compare: &Compare) -> bool {
        let current = self.kvs.get(&compare.key);
        match &compare.target {
            // A missing key has no value to compare against
            TargetValue::Value(expected) => current
                .map(|kv| compare.op.matches(kv.value.as_slice(), expected.as_slice()))
                .unwrap_or(false),
            TargetValue::Version(expected) => {
                compare.op.matches(&current.map_or(0, |kv| kv.version), expected)
            }
            TargetValue::CreateRevision(expected) => {
                compare.op.matches(&current.map_or(0, |kv| kv.create_revision), expected)
            }
            TargetValue::ModRevision(expected) => {
                compare.op.matches(&current.map_or(0, |kv| kv.mod_revision), expected)
            }
            TargetValue::Lease(expected) => {
                compare.op.matches(&current.map_or(0, |kv| kv.lease), expected)
            }
        }
    }
}

#[async_trait]
impl KvNode for MemoryNode {
    fn endpoint(&self, _key: Option<&str>) -> String {
        self.endpoint.clone()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        Ok(state.kvs.get(key).map(|kv| kv.value.clone()))
    }

    async fn put(&self, key: &str, value: &[u8], options: PutOptions) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());

        let revision = state.revision + 1;
        let response = state
            .put_at(revision, key, value, options)
            .map_err(|(code, message)| RouterError::status(&self.endpoint, code, message))?;
        state.revision = revision;

        Ok(response.prev_kv.map(|kv| kv.value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());

        let deleted = state.delete_at(key).deleted > 0;
        if deleted {
            state.revision += 1;
        }
        Ok(deleted)
    }

    async fn txn(&self, _key: &str, request: TxnRequest) -> Result<TxnResponse> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());

        let succeeded = request.compare.iter().all(|c| state.evaluate(c));
        let branch = if succeeded {
            &request.success
        } else {
            &request.failure
        };

        // Nothing is applied unless every op of the branch can be
        for op in branch {
            if let RequestOp::Put { lease, .. } = op {
                if *lease != 0 && !state.leases.contains_key(lease) {
                    return Err(self.not_found("requested lease not found"));
                }
            }
        }

        // Every write of one transaction shares a single revision
        let revision = state.revision + 1;
        let mut wrote = false;
        let mut responses = Vec::with_capacity(branch.len());

        for op in branch {
            let response = match op {
                RequestOp::Range { key } => ResponseOp::Range(state.range(key)),
                RequestOp::Put { key, value, lease } => {
                    let options = PutOptions::new().with_lease(*lease);
                    let put = state
                        .put_at(revision, key, value, options)
                        .map_err(|(code, message)| {
                            RouterError::status(&self.endpoint, code, message)
                        })?;
                    wrote = true;
                    ResponseOp::Put(put)
                }
                RequestOp::DeleteRange { key } => {
                    let deleted = state.delete_at(key);
                    wrote |= deleted.deleted > 0;
                    ResponseOp::DeleteRange(deleted)
                }
            };
            responses.push(response);
        }

        if wrote {
            state.revision = revision;
        }

        Ok(TxnResponse {
            succeeded,
            responses,
        })
    }

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId> {
        if ttl <= 0 {
            return Err(self.invalid(format!("lease TTL must be positive, got {}", ttl)));
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        state.expire_leases(now);

        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: now + Duration::from_secs(ttl as u64),
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());

        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(self.not_found("requested lease not found"))
        }
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<i64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.expire_leases(now);

        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.expires_at = now + Duration::from_secs(entry.ttl as u64);
                Ok(entry.ttl)
            }
            None => Err(self.not_found("requested lease not found")),
        }
    }
}
