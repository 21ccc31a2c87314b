use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DevToolsError {
    #[error("Connection error for {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("Gave up connecting after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<DevToolsError>,
    },

    #[error("Connection lost {failures} times within {window:?}, not reconnecting again")]
    ReconnectLimitExceeded { failures: u32, window: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Protocol error: {code} - {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("'{method}' timed out after {after:?}")]
    TimedOut { method: String, after: Duration },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Domain \"{domain}\" is not enabled, enable it first")]
    DomainNotEnabled { domain: String },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("No target to attach to: {0}")]
    TargetNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Classification of the error codes browsers put in protocol error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    ResourceNotFound,
    MethodNotFound,
    InvalidParameters,
    Unknown,
}

impl ProtocolErrorKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            -32000 => Self::ResourceNotFound,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParameters,
            _ => Self::Unknown,
        }
    }
}

impl DevToolsError {
    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn connection(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// `None` unless this is a `Protocol` error.
    pub fn protocol_kind(&self) -> Option<ProtocolErrorKind> {
        match self {
            Self::Protocol { code, .. } => Some(ProtocolErrorKind::from_code(*code)),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}
