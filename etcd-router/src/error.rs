//! Error types for the router

use thiserror::Error;

/// Result type alias for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// How a failure should be treated by the failover layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The node could not be reached or did not answer in time. Retried on
    /// another node and counted against the node's health.
    Transient,
    /// A healthy node answered with a correct refusal (bad argument,
    /// failed precondition, ...). Surfaced unchanged.
    Rejected,
    /// Everything else. Surfaced unchanged.
    Fatal,
}

/// gRPC status codes as reported by etcd
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Map a numeric gRPC code. Codes outside 0..=16 are `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Numeric gRPC code
    pub fn code(&self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::Cancelled => 1,
            Self::Unknown => 2,
            Self::InvalidArgument => 3,
            Self::DeadlineExceeded => 4,
            Self::NotFound => 5,
            Self::AlreadyExists => 6,
            Self::PermissionDenied => 7,
            Self::ResourceExhausted => 8,
            Self::FailedPrecondition => 9,
            Self::Aborted => 10,
            Self::OutOfRange => 11,
            Self::Unimplemented => 12,
            Self::Internal => 13,
            Self::Unavailable => 14,
            Self::DataLoss => 15,
            Self::Unauthenticated => 16,
        }
    }

    /// Best-effort mapping of an HTTP status when the gateway body carries no code
    pub fn from_http(status: u16) -> Self {
        match status {
            200..=299 => Self::Ok,
            400 => Self::InvalidArgument,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            408 | 504 => Self::DeadlineExceeded,
            409 => Self::Aborted,
            412 => Self::FailedPrecondition,
            429 => Self::ResourceExhausted,
            499 => Self::Cancelled,
            501 => Self::Unimplemented,
            502 | 503 => Self::Unavailable,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable | Self::DeadlineExceeded => ErrorKind::Transient,
            Self::InvalidArgument
            | Self::NotFound
            | Self::AlreadyExists
            | Self::PermissionDenied
            | Self::FailedPrecondition
            | Self::Aborted
            | Self::OutOfRange
            | Self::Unauthenticated => ErrorKind::Rejected,
            _ => ErrorKind::Fatal,
        }
    }
}

/// Router error types
#[derive(Error, Debug)]
pub enum RouterError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Non-success status returned by a node
    #[error("{endpoint} returned {code:?}: {message}")]
    Status {
        endpoint: String,
        code: StatusCode,
        message: String,
    },

    /// The node answered with an empty body
    #[error("No response from {0}")]
    NoResponse(String),

    /// The node answered with something that could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A request could not be built from the given arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A keepalive answered for a different lease than requested
    #[error("Lease mismatch: requested {requested}, got {returned}")]
    LeaseMismatch { requested: i64, returned: i64 },

    /// A router was constructed with an unusable node list
    #[error("Invalid node: {0}")]
    InvalidNode(String),

    /// Every node of a failover pool is quarantined or already tried
    #[error("No node available: {0}")]
    NoNodeAvailable(String),

    /// Configuration could not be read or is inconsistent
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error while reading configuration
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl RouterError {
    /// Build a status error for `endpoint`
    pub fn status(
        endpoint: impl Into<String>,
        code: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self::Status {
            endpoint: endpoint.into(),
            code,
            message: message.into(),
        }
    }

    /// Classify this error for the retry policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            // A body cut off mid-read is a missing answer, not a bad one
            Self::HttpError(e) => {
                if e.is_connect()
                    || e.is_timeout()
                    || e.is_request()
                    || e.is_body()
                    || e.is_decode()
                {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            Self::Status { code, .. } => code.kind(),
            // An exhausted inner pool looks like an unreachable node to an outer router
            Self::NoResponse(_) | Self::NoNodeAvailable(_) => ErrorKind::Transient,
            Self::InvalidArgument(_) | Self::LeaseMismatch { .. } => ErrorKind::Rejected,
            Self::JsonError(_)
            | Self::InvalidUrl(_)
            | Self::InvalidResponse(_)
            | Self::InvalidNode(_)
            | Self::ConfigError(_)
            | Self::IoError(_)
            | Self::YamlError(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// gRPC status code carried by this error, if any
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}
