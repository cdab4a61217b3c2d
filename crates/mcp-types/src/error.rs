use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Well-known JSON-RPC 2.0 error codes plus MCP's own extensions.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Implementation-space code for a request that exceeded its deadline.
    pub const REQUEST_TIMEOUT: i64 = -32001;
    /// Implementation-space code for a transport that was torn down while a
    /// request was outstanding.
    pub const CONNECTION_CLOSED: i64 = -32000;
}

/// The `error` object of a JSON-RPC 2.0 error response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Typed errors surfaced to callers of the wire codec and, by re-export,
/// across the protocol engine and transports that build on it.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to parse message: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("request timed out")]
    RequestTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("server returned error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("unknown error code {0}")]
    Unknown(i64),
}

impl McpError {
    /// Maps to the JSON-RPC error code this variant represents on the wire.
    pub fn code(&self) -> i64 {
        match self {
            McpError::Parse(_) => codes::PARSE_ERROR,
            McpError::InvalidRequest(_) => codes::INVALID_REQUEST,
            McpError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => codes::INVALID_PARAMS,
            McpError::InternalError(_) => codes::INTERNAL_ERROR,
            McpError::RequestTimeout => codes::REQUEST_TIMEOUT,
            McpError::ConnectionClosed => codes::CONNECTION_CLOSED,
            McpError::Rpc { code, .. } => *code,
            McpError::Unknown(code) => *code,
        }
    }

    /// Builds the wire-level error object. Variants that carry their own
    /// message (`InvalidRequest`, `MethodNotFound`, `InvalidParams`,
    /// `InternalError`) send it verbatim rather than through `Display`, so
    /// e.g. `MethodNotFound("tools/call")` serializes as `{"message":
    /// "tools/call"}`, not `{"message": "method not found: tools/call"}` —
    /// callers that format their own deterministic text (§8 scenario 3's
    /// `"Tool <name> not found"`) see exactly that text on the wire.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            McpError::InvalidRequest(message)
            | McpError::MethodNotFound(message)
            | McpError::InvalidParams(message)
            | McpError::InternalError(message) => ErrorObject::new(self.code(), message.clone()),
            McpError::Rpc { code, message, data } => ErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => ErrorObject::new(other.code(), other.to_string()),
        }
    }

    /// Reconstructs a typed error from a wire-level error object, the
    /// inverse of [`McpError::to_error_object`].
    pub fn from_error_object(err: ErrorObject) -> Self {
        match err.code {
            codes::PARSE_ERROR => McpError::InvalidRequest(err.message),
            codes::INVALID_REQUEST => McpError::InvalidRequest(err.message),
            codes::METHOD_NOT_FOUND => McpError::MethodNotFound(err.message),
            codes::INVALID_PARAMS => McpError::InvalidParams(err.message),
            codes::INTERNAL_ERROR => McpError::InternalError(err.message),
            codes::REQUEST_TIMEOUT => McpError::RequestTimeout,
            codes::CONNECTION_CLOSED => McpError::ConnectionClosed,
            code => McpError::Rpc {
                code,
                message: err.message,
                data: err.data,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, McpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_error_object_sends_caller_message_verbatim() {
        let err = McpError::InvalidParams("Tool missing not found".to_string());
        let object = err.to_error_object();
        assert_eq!(object.code, codes::INVALID_PARAMS);
        assert_eq!(object.message, "Tool missing not found");
    }

    #[test]
    fn error_object_round_trips_through_from_error_object() {
        let err = McpError::MethodNotFound("tools/call".to_string());
        let round_tripped = McpError::from_error_object(err.to_error_object());
        assert!(matches!(round_tripped, McpError::MethodNotFound(m) if m == "tools/call"));
    }
}
