//! Shared request/response types

/// Lease identifier as issued by the store. `0` means "no lease".
pub type LeaseId = i64;

/// A stored key with its revision metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    /// Number of writes since creation; 0 for a key that does not exist
    pub version: i64,
    pub lease: LeaseId,
}

/// Options for a plain put
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Return the value the key held before this put
    pub prev_kv: bool,
    /// Attach the key to this lease (0 = none)
    pub lease: LeaseId,
    /// Keep the key's current lease
    pub ignore_lease: bool,
    /// Keep the key's current value
    pub ignore_value: bool,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_ignore_lease(mut self) -> Self {
        self.ignore_lease = true;
        self
    }

    pub fn with_ignore_value(mut self) -> Self {
        self.ignore_value = true;
        self
    }
}

/// Comparison operator of a compare clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareOp {
    #[default]
    Equal,
    Greater,
    Less,
    NotEqual,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "EQUAL",
            Self::Greater => "GREATER",
            Self::Less => "LESS",
            Self::NotEqual => "NOT_EQUAL",
        }
    }

    /// Evaluate `actual <op> expected`
    pub fn matches<T: Ord + ?Sized>(&self, actual: &T, expected: &T) -> bool {
        match self {
            Self::Equal => actual == expected,
            Self::Greater => actual > expected,
            Self::Less => actual < expected,
            Self::NotEqual => actual != expected,
        }
    }
}

/// Which attribute of a key a compare clause looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareTarget {
    Version,
    CreateRevision,
    ModRevision,
    #[default]
    Value,
    Lease,
}

impl CompareTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Version => "VERSION",
            Self::CreateRevision => "CREATE",
            Self::ModRevision => "MOD",
            Self::Value => "VALUE",
            Self::Lease => "LEASE",
        }
    }
}

/// Target attribute together with the value it is compared against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetValue {
    Version(i64),
    CreateRevision(i64),
    ModRevision(i64),
    Value(Vec<u8>),
    Lease(LeaseId),
}

impl TargetValue {
    pub fn target(&self) -> CompareTarget {
        match self {
            Self::Version(_) => CompareTarget::Version,
            Self::CreateRevision(_) => CompareTarget::CreateRevision,
            Self::ModRevision(_) => CompareTarget::ModRevision,
            Self::Value(_) => CompareTarget::Value,
            Self::Lease(_) => CompareTarget::Lease,
        }
    }
}

/// One predicate of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub op: CompareOp,
    pub target: TargetValue,
}

impl Compare {
    pub fn new(key: impl Into<String>, op: CompareOp, target: TargetValue) -> Self {
        Self {
            key: key.into(),
            op,
            target,
        }
    }
}

/// One operation inside a transaction branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOp {
    Range { key: String },
    Put {
        key: String,
        value: Vec<u8>,
        lease: LeaseId,
    },
    DeleteRange { key: String },
}

impl RequestOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Range { key } | Self::Put { key, .. } | Self::DeleteRange { key } => key,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResponse {
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRangeResponse {
    pub deleted: i64,
}

/// Result of one operation of the executed branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOp {
    Range(RangeResponse),
    Put(PutResponse),
    DeleteRange(DeleteRangeResponse),
}

/// A compare-then-branch transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    /// Operations run when any compare fails; may be empty
    pub failure: Vec<RequestOp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether every compare held and the success branch ran
    pub succeeded: bool,
    pub responses: Vec<ResponseOp>,
}

impl TxnResponse {
    /// Values fetched by the range operations of the executed branch, in
    /// order. A range that matched nothing contributes `None`.
    pub fn range_values(&self) -> Vec<Option<Vec<u8>>> {
        self.responses
            .iter()
            .filter_map(|op| match op {
                ResponseOp::Range(range) => Some(range.kvs.first().map(|kv| kv.value.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Outcome of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The compare held and the write was applied
    Applied,
    /// The compare failed; the current value was not requested
    Rejected,
    /// The compare failed; carries the key's current value (`None` if absent)
    RejectedWithCurrent(Option<Vec<u8>>),
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}
