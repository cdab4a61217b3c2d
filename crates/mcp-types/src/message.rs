use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorObject;
use crate::ids::RequestId;

const JSONRPC_VERSION: &str = "2.0";

/// A single JSON-RPC 2.0 request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A successful JSON-RPC 2.0 response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

/// A JSON-RPC 2.0 error response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: RequestId,
    pub error: ErrorObject,
}

/// A JSON-RPC 2.0 notification (no id, no reply expected).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC 2.0 message: a tagged union of the four variants the wire
/// format supports. `Message` is the unit the rest of the runtime speaks;
/// everything above this is decoded lazily from `params`/`result` once a
/// message has been classified and routed.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Error(ErrorResponse),
    Notification(Notification),
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Message::Response(Response { id, result })
    }

    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Message::Error(ErrorResponse { id, error })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => Some(&r.id),
            Message::Error(e) => Some(&e.id),
            Message::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) | Message::Error(_) => None,
        }
    }
}

/// The envelope discriminator used only for encoding; unknown keys are
/// tolerated on decode and explicit nulls are never emitted on encode since
/// every field here is `skip_serializing_if`-guarded except the ones the
/// variant requires.
#[derive(Serialize, Deserialize)]
struct Envelope {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

impl Message {
    /// Serializes this message to its canonical JSON text, one value per
    /// message (the caller appends the wire-level line terminator for
    /// framed transports).
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_envelope())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.to_envelope()).expect("Envelope serialization cannot fail")
    }

    fn to_envelope(&self) -> Envelope {
        match self {
            Message::Request(r) => Envelope {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: Some(r.id.clone()),
                method: Some(r.method.clone()),
                params: r.params.clone(),
                result: None,
                error: None,
            },
            Message::Response(r) => Envelope {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: Some(r.id.clone()),
                method: None,
                params: None,
                result: Some(r.result.clone()),
                error: None,
            },
            Message::Error(e) => Envelope {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: Some(e.id.clone()),
                method: None,
                params: None,
                result: None,
                error: Some(e.error.clone()),
            },
            Message::Notification(n) => Envelope {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: None,
                method: Some(n.method.clone()),
                params: n.params.clone(),
                result: None,
                error: None,
            },
        }
    }

    /// Decodes a single JSON text into a classified [`Message`].
    ///
    /// Classification inspects fields in a fixed order:
    /// `method && id` is a request, `method && !id` is a notification,
    /// `result` is a response, `error` is an error response. Unknown object
    /// keys are ignored by `serde_json`'s default behavior.
    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Ok(Self::from_envelope(envelope))
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        let envelope: Envelope = serde_json::from_value(value)?;
        Ok(Self::from_envelope(envelope))
    }

    fn from_envelope(envelope: Envelope) -> Self {
        match (envelope.method, envelope.id, envelope.result, envelope.error) {
            (Some(method), Some(id), _, _) => Message::Request(Request {
                id,
                method,
                params: envelope.params,
            }),
            (Some(method), None, _, _) => Message::Notification(Notification {
                method,
                params: envelope.params,
            }),
            (None, Some(id), Some(result), _) => Message::Response(Response { id, result }),
            (None, Some(id), None, Some(error)) => Message::Error(ErrorResponse { id, error }),
            (None, Some(id), None, None) => {
                // Neither result nor error: treat as an empty success, matching
                // permissive peers that omit `result` for unit responses.
                Message::Response(Response {
                    id,
                    result: Value::Null,
                })
            }
            (None, None, _, _) => Message::Notification(Notification {
                method: String::new(),
                params: envelope.params,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_request() {
        let msg = Message::request(1_i64, "ping", None);
        let text = msg.to_json_string().unwrap();
        let back = Message::from_json_str(&text).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn round_trips_response_with_integer_id() {
        let msg = Message::response(RequestId::Number(7), json!({"ok": true}));
        let text = msg.to_json_string().unwrap();
        assert!(text.contains("\"id\":7"));
        let back = Message::from_json_str(&text).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn classifies_notification_without_id() {
        let text = r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":1,"progress":50}}"#;
        let msg = Message::from_json_str(text).unwrap();
        assert!(matches!(msg, Message::Notification(_)));
    }

    #[test]
    fn classifies_error_response() {
        let text = r#"{"jsonrpc":"2.0","id":"abc","error":{"code":-32602,"message":"bad"}}"#;
        let msg = Message::from_json_str(text).unwrap();
        match msg {
            Message::Error(e) => {
                assert_eq!(e.id, RequestId::String("abc".into()));
                assert_eq!(e.error.code, -32602);
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let text = r#"{"jsonrpc":"2.0","id":1,"result":{},"extra_vendor_field":true}"#;
        let msg = Message::from_json_str(text).unwrap();
        assert!(matches!(msg, Message::Response(_)));
    }
}
