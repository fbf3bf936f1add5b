//! Store node backed by one etcd member
//!
//! Talks to the etcd v3 JSON gateway (`/v3/kv/*`, `/v3/lease/*`). Keys and
//! values travel base64 encoded; int64 fields are sent as strings and
//! accepted as strings or numbers.

use crate::error::{Result, RouterError, StatusCode};
use crate::node::KvNode;
use crate::types::{
    Compare, DeleteRangeResponse, KeyValue, LeaseId, PutOptions, PutResponse, RangeResponse,
    RequestOp, ResponseOp, TargetValue, TxnRequest, TxnResponse,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Connection settings for one etcd member
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// `host:port` or a full URL; also the node's endpoint identity
    pub endpoint: String,
    /// Request timeout
    pub timeout: Duration,
    /// Optional authentication token
    pub auth_token: Option<String>,
}

impl EtcdConfig {
    /// Create a new configuration for the given endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(5),
            auth_token: None,
        }
    }

    /// Set the timeout for requests
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the authentication token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// One etcd member reached over HTTP
#[derive(Clone)]
pub struct EtcdNode {
    endpoint: String,
    base_url: Url,
    http_client: Client,
}

impl EtcdNode {
    /// Create a node. Endpoints without a scheme are taken as `http://`.
    pub fn new(config: EtcdConfig) -> Result<Self> {
        let base_url = Self::parse_base_url(&config.endpoint)?;

        let mut http_client_builder = Client::builder().timeout(config.timeout);

        if let Some(ref token) = config.auth_token {
            let value = HeaderValue::from_str(token).map_err(|e| {
                RouterError::ConfigError(format!("invalid auth token for {}: {}", config.endpoint, e))
            })?;
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, value);
            http_client_builder = http_client_builder.default_headers(headers);
        }

        let http_client = http_client_builder.build()?;

        Ok(Self {
            endpoint: config.endpoint,
            base_url,
            http_client,
        })
    }

    fn parse_base_url(endpoint: &str) -> Result<Url> {
        let mut url = if endpoint.contains("://") {
            Url::parse(endpoint)?
        } else {
            Url::parse(&format!("http://{}", endpoint))?
        };
        if url.cannot_be_a_base() {
            return Err(RouterError::ConfigError(format!(
                "endpoint {} cannot be used as a base URL",
                endpoint
            )));
        }
        // Keep any path prefix when joining gateway paths
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// POST `body` to a gateway path and decode the answer
    async fn send_request<R: DeserializeOwned>(&self, path: &str, body: Value) -> Result<R> {
        let text = self.post(path, body).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn post(&self, path: &str, body: Value) -> Result<String> {
        let url = self.base_url.join(path)?;
        debug!("POST {} on {}", path, self.endpoint);

        let response = self.http_client.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(self.gateway_error(status.as_u16(), &text));
        }
        if text.trim().is_empty() {
            return Err(RouterError::NoResponse(self.endpoint.clone()));
        }
        Ok(text)
    }

    /// Build the status error for a non-success answer
    fn gateway_error(&self, http_status: u16, body: &str) -> RouterError {
        let (code, message) = match serde_json::from_str::<GatewayError>(body) {
            Ok(error) => {
                let code = match error.code {
                    Some(code) if code != 0 => StatusCode::from_code(code),
                    _ => StatusCode::from_http(http_status),
                };
                let message = if error.message.is_empty() {
                    error.error
                } else {
                    error.message
                };
                (code, message)
            }
            Err(_) => (StatusCode::from_http(http_status), body.trim().to_string()),
        };
        debug!(
            "{} answered HTTP {} ({:?}): {}",
            self.endpoint, http_status, code, message
        );
        RouterError::status(&self.endpoint, code, message)
    }
}

#[async_trait]
impl KvNode for EtcdNode {
    fn endpoint(&self, _key: Option<&str>) -> String {
        self.endpoint.clone()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let range: WireRange = self
            .send_request("v3/kv/range", json!({ "key": encode(key.as_bytes()) }))
            .await?;
        range.kvs.first().map(|kv| decode(&kv.value)).transpose()
    }

    async fn put(&self, key: &str, value: &[u8], options: PutOptions) -> Result<Option<Vec<u8>>> {
        // etcd refuses a value or lease alongside the matching ignore flag
        let value = if options.ignore_value { &[][..] } else { value };
        let lease = if options.ignore_lease { 0 } else { options.lease };

        let body = json!({
            "key": encode(key.as_bytes()),
            "value": encode(value),
            "lease": lease.to_string(),
            "prev_kv": options.prev_kv,
            "ignore_value": options.ignore_value,
            "ignore_lease": options.ignore_lease,
        });
        let put: WirePut = self.send_request("v3/kv/put", body).await?;

        match put.prev_kv {
            Some(kv) if options.prev_kv => Ok(Some(decode(&kv.value)?)),
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let deleted: WireDeleteRange = self
            .send_request("v3/kv/deleterange", json!({ "key": encode(key.as_bytes()) }))
            .await?;
        Ok(deleted.deleted > 0)
    }

    async fn txn(&self, _key: &str, request: TxnRequest) -> Result<TxnResponse> {
        let txn: WireTxn = self.send_request("v3/kv/txn", txn_body(&request)).await?;
        txn.into_response()
    }

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId> {
        let lease: WireLease = self
            .send_request(
                "v3/lease/grant",
                json!({ "TTL": ttl.to_string(), "ID": "0" }),
            )
            .await?;
        if !lease.error.is_empty() {
            return Err(RouterError::status(
                &self.endpoint,
                StatusCode::Unknown,
                lease.error,
            ));
        }
        Ok(lease.id)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let _: Value = self
            .send_request("v3/lease/revoke", json!({ "ID": lease.to_string() }))
            .await?;
        Ok(())
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<i64> {
        let text = self
            .post("v3/lease/keepalive", json!({ "ID": lease.to_string() }))
            .await?;
        let refreshed = self.decode_keepalive(&text)?;

        if refreshed.id != lease {
            return Err(RouterError::LeaseMismatch {
                requested: lease,
                returned: refreshed.id,
            });
        }
        if refreshed.ttl <= 0 {
            return Err(RouterError::status(
                &self.endpoint,
                StatusCode::NotFound,
                format!("lease {} not found", lease),
            ));
        }
        Ok(refreshed.ttl)
    }
}

impl EtcdNode {
    /// The keepalive endpoint streams one JSON object per line, wrapped in
    /// `{"result": ...}` or `{"error": ...}`; only the first one matters.
    fn decode_keepalive(&self, text: &str) -> Result<WireLease> {
        let line = text
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| RouterError::NoResponse(self.endpoint.clone()))?;
        let frame: KeepAliveFrame = serde_json::from_str(line)?;

        if let Some(error) = frame.error {
            let code = if error.grpc_code != 0 {
                StatusCode::from_code(error.grpc_code)
            } else {
                StatusCode::from_http(error.http_code as u16)
            };
            return Err(RouterError::status(&self.endpoint, code, error.message));
        }
        match frame.result {
            Some(result) => Ok(result),
            None => Ok(serde_json::from_str(line)?),
        }
    }
}

fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn decode(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| RouterError::InvalidResponse(format!("bad base64 payload: {}", e)))
}

fn compare_json(compare: &Compare) -> Value {
    let mut clause = json!({
        "result": compare.op.as_str(),
        "target": compare.target.target().as_str(),
        "key": encode(compare.key.as_bytes()),
    });
    let (field, value) = match &compare.target {
        TargetValue::Version(v) => ("version", json!(v.to_string())),
        TargetValue::CreateRevision(v) => ("create_revision", json!(v.to_string())),
        TargetValue::ModRevision(v) => ("mod_revision", json!(v.to_string())),
        TargetValue::Value(v) => ("value", json!(encode(v))),
        TargetValue::Lease(v) => ("lease", json!(v.to_string())),
    };
    clause[field] = value;
    clause
}

fn request_op_json(op: &RequestOp) -> Value {
    match op {
        RequestOp::Range { key } => json!({
            "request_range": { "key": encode(key.as_bytes()) }
        }),
        RequestOp::Put { key, value, lease } => json!({
            "request_put": {
                "key": encode(key.as_bytes()),
                "value": encode(value),
                "lease": lease.to_string(),
            }
        }),
        RequestOp::DeleteRange { key } => json!({
            "request_delete_range": { "key": encode(key.as_bytes()) }
        }),
    }
}

fn txn_body(request: &TxnRequest) -> Value {
    json!({
        "compare": request.compare.iter().map(compare_json).collect::<Vec<_>>(),
        "success": request.success.iter().map(request_op_json).collect::<Vec<_>>(),
        "failure": request.failure.iter().map(request_op_json).collect::<Vec<_>>(),
    })
}

/// int64 fields come as JSON strings from the gateway, numbers from others
fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }

    match Int64::deserialize(deserializer)? {
        Int64::Number(n) => Ok(n),
        Int64::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GatewayError {
    error: String,
    code: Option<i64>,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireKeyValue {
    key: String,
    value: String,
    #[serde(deserialize_with = "de_i64")]
    create_revision: i64,
    #[serde(deserialize_with = "de_i64")]
    mod_revision: i64,
    #[serde(deserialize_with = "de_i64")]
    version: i64,
    #[serde(deserialize_with = "de_i64")]
    lease: i64,
}

impl WireKeyValue {
    fn into_key_value(self) -> Result<KeyValue> {
        Ok(KeyValue {
            key: decode(&self.key)?,
            value: decode(&self.value)?,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
            lease: self.lease,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireRange {
    kvs: Vec<WireKeyValue>,
    #[serde(deserialize_with = "de_i64")]
    count: i64,
}

impl WireRange {
    fn into_response(self) -> Result<RangeResponse> {
        Ok(RangeResponse {
            kvs: self
                .kvs
                .into_iter()
                .map(WireKeyValue::into_key_value)
                .collect::<Result<_>>()?,
            count: self.count,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePut {
    prev_kv: Option<WireKeyValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireDeleteRange {
    #[serde(deserialize_with = "de_i64")]
    deleted: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireResponseOp {
    response_range: Option<WireRange>,
    response_put: Option<WirePut>,
    response_delete_range: Option<WireDeleteRange>,
}

impl WireResponseOp {
    fn into_response(self) -> Result<ResponseOp> {
        if let Some(range) = self.response_range {
            return Ok(ResponseOp::Range(range.into_response()?));
        }
        if let Some(put) = self.response_put {
            let prev_kv = put.prev_kv.map(WireKeyValue::into_key_value).transpose()?;
            return Ok(ResponseOp::Put(PutResponse { prev_kv }));
        }
        if let Some(delete) = self.response_delete_range {
            return Ok(ResponseOp::DeleteRange(DeleteRangeResponse {
                deleted: delete.deleted,
            }));
        }
        Err(RouterError::InvalidResponse(
            "transaction response without an operation".to_string(),
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireTxn {
    succeeded: bool,
    responses: Vec<WireResponseOp>,
}

impl WireTxn {
    fn into_response(self) -> Result<TxnResponse> {
        Ok(TxnResponse {
            succeeded: self.succeeded,
            responses: self
                .responses
                .into_iter()
                .map(WireResponseOp::into_response)
                .collect::<Result<_>>()?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireLease {
    #[serde(rename = "ID", deserialize_with = "de_i64")]
    id: i64,
    #[serde(rename = "TTL", deserialize_with = "de_i64")]
    ttl: i64,
    error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeepAliveFrame {
    result: Option<WireLease>,
    error: Option<StreamError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamError {
    grpc_code: i64,
    http_code: i64,
    message: String,
}
