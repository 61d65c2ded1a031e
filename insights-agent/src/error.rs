// ABOUTME: Error taxonomy shared by transports, backends and sessions.
// ABOUTME: ProcessError/RpcError come off the wire, BackendError carries a typed ErrorCode.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// JSON-RPC error codes used on the wire
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Application-defined: the user denied the operation
    pub const PERMISSION_DENIED: i64 = -32000;
}

/// Subprocess or transport failure. Fatal to the backend that owns the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessError {
    pub message: String,
}

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A JSON-RPC error object, either received from the peer or sent back to it
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("JSON-RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(codes::PERMISSION_DENIED, message)
    }
}

/// Failure of an outbound JSON-RPC request
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl RequestError {
    /// Keep transport failures as-is, surface peer errors as a BackendError with `code`
    pub fn into_agent_error(self, code: ErrorCode) -> AgentError {
        match self {
            RequestError::Process(e) => AgentError::Process(e),
            RequestError::Rpc(e) => AgentError::Backend(BackendError::new(code, e.message)),
        }
    }
}

/// Typed error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Subprocess or protocol failure while creating a session
    SessionCreateError,
    /// A message could not be delivered to the backend
    SendError,
    /// The session was killed or its subprocess exited
    SessionClosed,
    /// The backend has no way to perform the operation
    Unsupported,
    /// The peer sent something that violates the protocol
    ProtocolError,
    /// Request timed out
    Timeout,
    /// Rate limited by the backend
    RateLimited,
    /// Authentication failed
    AuthFailed,
    /// Permission denied for operation
    PermissionDenied,
    /// Unknown error
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SessionCreateError => "SESSION_CREATE_ERROR",
            ErrorCode::SendError => "SEND_ERROR",
            ErrorCode::SessionClosed => "SESSION_CLOSED",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a backend or session operation
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: ErrorCode,
    pub message: String,
    /// Whether retrying the operation can succeed
    pub recoverable: bool,
}

impl BackendError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let recoverable = matches!(
            code,
            ErrorCode::Timeout | ErrorCode::RateLimited | ErrorCode::SendError
        );
        Self {
            code,
            message: message.into(),
            recoverable,
        }
    }

    pub fn unsupported(what: &str) -> Self {
        Self::new(ErrorCode::Unsupported, format!("{} is not supported by this backend", what))
    }

    pub fn session_closed() -> Self {
        Self::new(ErrorCode::SessionClosed, "Session is closed")
    }
}

/// Error returned from the AgentBackend / AgentSession surface
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl AgentError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            AgentError::Process(_) => None,
            AgentError::Backend(e) => Some(e.code),
        }
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
