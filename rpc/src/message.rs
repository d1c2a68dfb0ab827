//! JSON-RPC 2.0 envelope carried one per frame.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
/// Implementation-defined code used when a method handler fails
pub const HANDLER_ERROR: i32 = -32000;

/// Correlation id of a request. JSON-RPC allows numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        RequestId::Number(value)
    }
}

/// A call that expects exactly one response with the same id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id:      RequestId,
    pub method:  String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params:  Value,
}

/// A one-way call; the receiver never answers it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotificationMessage {
    pub jsonrpc: String,
    pub method:  String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params:  Value,
}

/// Error object of a failed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct RpcError {
    pub code:    i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data:    Option<Value>,
}

impl RpcError {
    pub fn new<S: Into<String>>(code: i32, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Reply to an [`RpcRequest`]; carries either `result` or `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    /// `None` only when the request id could not be read
    pub id:      Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result:  Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error:   Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id:      Some(id),
            result:  Some(result),
            error:   None,
        }
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Any frame of the protocol.
///
/// Variant order matters for untagged decoding: a request needs both `id`
/// and `method`, a notification only `method`, a response neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Notification(RpcNotificationMessage),
    Response(RpcResponse),
}

impl RpcMessage {
    pub fn request<S: Into<String>>(id: RequestId, method: S, params: Value) -> Self {
        RpcMessage::Request(RpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification<S: Into<String>>(method: S, params: Value) -> Self {
        RpcMessage::Notification(RpcNotificationMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        })
    }

    /// Decode one frame
    pub fn from_frame(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }

    /// Encode as a single-line frame. serde_json escapes line terminators
    /// inside strings, so the output never contains a raw newline.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
