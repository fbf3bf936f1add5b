//! Compare-and-swap transaction construction
//!
//! A conditional write is a single transaction: one compare clause, the
//! write as the success branch, and optionally a read of the same key as the
//! failure branch so a losing writer learns the conflicting value without a
//! second round trip.

use crate::error::{Result, RouterError};
use crate::types::{
    CasOutcome, Compare, CompareOp, CompareTarget, LeaseId, RequestOp, ResponseOp, TargetValue,
    TxnRequest, TxnResponse,
};

/// Build a compare clause.
///
/// `expected = None` means the key must not exist. A stored value may
/// legitimately be empty, so absence is tested as `version == 0` whatever
/// `op` and `target` were asked for.
///
/// For the numeric targets the expected value is parsed as a decimal integer.
pub fn compare(
    key: &str,
    expected: Option<&[u8]>,
    op: CompareOp,
    target: CompareTarget,
) -> Result<Compare> {
    let Some(expected) = expected else {
        return Ok(Compare::new(key, CompareOp::Equal, TargetValue::Version(0)));
    };

    let target = match target {
        CompareTarget::Value => TargetValue::Value(expected.to_vec()),
        CompareTarget::Version => TargetValue::Version(parse_number(key, expected)?),
        CompareTarget::CreateRevision => {
            TargetValue::CreateRevision(parse_number(key, expected)?)
        }
        CompareTarget::ModRevision => TargetValue::ModRevision(parse_number(key, expected)?),
        CompareTarget::Lease => TargetValue::Lease(parse_number(key, expected)?),
    };

    Ok(Compare::new(key, op, target))
}

fn parse_number(key: &str, raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| {
            RouterError::InvalidArgument(format!(
                "compare value for {} is not an integer: {:?}",
                key,
                String::from_utf8_lossy(raw)
            ))
        })
}

pub fn put_operation(key: &str, value: &[u8], lease: LeaseId) -> RequestOp {
    RequestOp::Put {
        key: key.to_string(),
        value: value.to_vec(),
        lease,
    }
}

pub fn delete_operation(key: &str) -> RequestOp {
    RequestOp::DeleteRange {
        key: key.to_string(),
    }
}

pub fn get_operation(key: &str) -> RequestOp {
    RequestOp::Range {
        key: key.to_string(),
    }
}

/// The write performed when the compare holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasAction {
    Put { value: Vec<u8>, lease: LeaseId },
    Delete,
}

/// A conditional put or delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasRequest {
    key: String,
    action: CasAction,
    compare_key: String,
    expected: Option<Vec<u8>>,
    op: CompareOp,
    target: CompareTarget,
    return_current_on_failure: bool,
}

impl CasRequest {
    /// Put `value` at `key` if the key currently holds `expected`
    /// (`None`: if the key does not exist)
    pub fn put_if(
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        expected: Option<&[u8]>,
    ) -> Self {
        Self::new(
            key.into(),
            CasAction::Put {
                value: value.into(),
                lease: 0,
            },
            expected,
        )
    }

    /// Delete `key` if it currently holds `expected`
    pub fn delete_if(key: impl Into<String>, expected: Option<&[u8]>) -> Self {
        Self::new(key.into(), CasAction::Delete, expected)
    }

    fn new(key: String, action: CasAction, expected: Option<&[u8]>) -> Self {
        Self {
            compare_key: key.clone(),
            key,
            action,
            expected: expected.map(<[u8]>::to_vec),
            op: CompareOp::Equal,
            target: CompareTarget::Value,
            return_current_on_failure: false,
        }
    }

    /// Fetch the current value in the same round trip when the compare fails
    pub fn return_current(mut self, enabled: bool) -> Self {
        self.return_current_on_failure = enabled;
        self
    }

    /// Attach the written key to a lease (put only)
    pub fn with_lease(mut self, lease_id: LeaseId) -> Self {
        if let CasAction::Put { lease, .. } = &mut self.action {
            *lease = lease_id;
        }
        self
    }

    /// Compare a different key than the one written
    pub fn compare_on(mut self, key: impl Into<String>) -> Self {
        self.compare_key = key.into();
        self
    }

    pub fn with_operator(mut self, op: CompareOp) -> Self {
        self.op = op;
        self
    }

    pub fn with_target(mut self, target: CompareTarget) -> Self {
        self.target = target;
        self
    }

    /// Key written by this request; also the key it is routed by
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn action(&self) -> &CasAction {
        &self.action
    }

    pub fn returns_current(&self) -> bool {
        self.return_current_on_failure
    }

    /// Translate into the primitive transaction format
    pub fn to_txn(&self) -> Result<TxnRequest> {
        let clause = compare(
            &self.compare_key,
            self.expected.as_deref(),
            self.op,
            self.target,
        )?;

        let operation = match &self.action {
            CasAction::Put { value, lease } => put_operation(&self.key, value, *lease),
            CasAction::Delete => delete_operation(&self.key),
        };

        let failure = if self.return_current_on_failure {
            vec![get_operation(&self.key)]
        } else {
            Vec::new()
        };

        Ok(TxnRequest {
            compare: vec![clause],
            success: vec![operation],
            failure,
        })
    }

    /// Interpret the store's answer to [`CasRequest::to_txn`]
    pub fn outcome(&self, response: &TxnResponse) -> Result<CasOutcome> {
        if response.succeeded {
            return Ok(CasOutcome::Applied);
        }
        if !self.return_current_on_failure {
            return Ok(CasOutcome::Rejected);
        }

        match response.responses.first() {
            Some(ResponseOp::Range(range)) => Ok(CasOutcome::RejectedWithCurrent(
                range.kvs.first().map(|kv| kv.value.clone()),
            )),
            other => Err(RouterError::InvalidResponse(format!(
                "expected a range response in the failure branch for {}, got {:?}",
                self.key, other
            ))),
        }
    }
}
