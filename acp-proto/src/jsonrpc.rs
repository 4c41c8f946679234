//! Core JSON-RPC message model.
//!
//! Messages travel one per line (newline-delimited JSON). Every message is
//! serialized with `"jsonrpc": "2.0"`; on input the version field is optional.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const COMMUNICATION_FAILURE: i32 = -32000;

/// A request id. Ids are only meaningful on the connection that issued them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Number(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::String(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::String(value)
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i32, message: impl ToString) -> Self {
        Self {
            code,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn internal_error(message: impl ToString) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A single JSON-RPC message as it appears on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum JsonRpcMessage {
    Request {
        id: Id,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Id,
        result: Result<Value, ResponseError>,
    },
}

impl JsonRpcMessage {
    pub fn request(id: impl Into<Id>, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: id.into(),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Notification {
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn response(id: impl Into<Id>, result: Result<Value, ResponseError>) -> Self {
        JsonRpcMessage::Response {
            id: id.into(),
            result,
        }
    }

    /// The method of a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } | JsonRpcMessage::Notification { method, .. } => {
                Some(method)
            }
            JsonRpcMessage::Response { .. } => None,
        }
    }

    /// The id of a request or response.
    pub fn id(&self) -> Option<&Id> {
        match self {
            JsonRpcMessage::Request { id, .. } | JsonRpcMessage::Response { id, .. } => Some(id),
            JsonRpcMessage::Notification { .. } => None,
        }
    }

    /// Serialize to a single line (without the trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Wire representation; the union is decided by which members are present.
#[derive(Serialize, Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ResponseError>,
}

impl From<JsonRpcMessage> for RawMessage {
    fn from(message: JsonRpcMessage) -> Self {
        let mut raw = RawMessage {
            jsonrpc: Some("2.0".to_string()),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match message {
            JsonRpcMessage::Request { id, method, params } => {
                raw.id = Some(id);
                raw.method = Some(method);
                raw.params = params;
            }
            JsonRpcMessage::Notification { method, params } => {
                raw.method = Some(method);
                raw.params = params;
            }
            JsonRpcMessage::Response {
                id,
                result: Ok(value),
            } => {
                raw.id = Some(id);
                raw.result = Some(value);
            }
            JsonRpcMessage::Response {
                id,
                result: Err(error),
            } => {
                raw.id = Some(id);
                raw.error = Some(error);
            }
        }
        raw
    }
}

impl TryFrom<RawMessage> for JsonRpcMessage {
    type Error = String;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Ok(JsonRpcMessage::Request {
                id,
                method,
                params: raw.params,
            }),
            (Some(method), None) => Ok(JsonRpcMessage::Notification {
                method,
                params: raw.params,
            }),
            // `"result": null` deserializes as `None`, so a missing result is a null result.
            (None, Some(id)) => Ok(JsonRpcMessage::Response {
                id,
                result: match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                },
            }),
            (None, None) => Err("message has neither `method` nor `id`".to_string()),
        }
    }
}
