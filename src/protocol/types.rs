//! JSON-RPC 2.0 envelope types and well-known notifications.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::borrow::Cow;
use std::fmt;

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names of notifications emitted by every backend.
pub mod methods {
    /// One-time readiness announcement listing supported methods.
    pub const READY: &str = "$ready";
    /// Recurring domain events, discriminated by their `type` field.
    pub const EVENT: &str = "$event";
    /// Recovered or fatal error announcement.
    pub const ERROR: &str = "error";
    /// Sent once when the backend exits because of a signal.
    pub const EXIT: &str = "exit";
}

/// JSON-RPC request ID - can be string or number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// JSON-RPC 2.0 Request.
///
/// `id: None` is serialized as an explicit `null` so that an idless request
/// stays distinguishable from a notification on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC 2.0 Response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON-RPC 2.0 Notification (a message without an id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// The `$ready` announcement.
    pub fn ready(version: &str, methods: &[String]) -> Self {
        Self::new(methods::READY).with_params(json!({
            "version": version,
            "methods": methods,
        }))
    }

    /// A `$event` notification of the given kind.
    ///
    /// Object `fields` are merged next to `type`; any other value is nested
    /// under `data`.
    pub fn event(kind: &str, fields: Value) -> Self {
        let mut params = Map::new();
        params.insert("type".into(), Value::String(kind.into()));
        match fields {
            Value::Object(map) => params.extend(map),
            Value::Null => {}
            other => {
                params.insert("data".into(), other);
            }
        }
        Self::new(methods::EVENT).with_params(Value::Object(params))
    }

    /// A level-tagged `log` event.
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::event(
            "log",
            json!({
                "level": level,
                "message": message.into(),
            }),
        )
    }

    /// An `error` announcement.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(methods::ERROR).with_params(json!({ "message": message.into() }))
    }

    /// An `error` announcement carrying a JSON-RPC error code.
    pub fn error_with_code(code: i32, message: impl Into<String>) -> Self {
        Self::new(methods::ERROR).with_params(json!({
            "code": code,
            "message": message.into(),
        }))
    }

    /// The `exit` announcement sent when a signal ends the backend.
    pub fn exit(message: impl Into<String>) -> Self {
        Self::new(methods::EXIT).with_params(json!({ "message": message.into() }))
    }
}

/// JSON-RPC 2.0 Error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&ProtocolError> for JsonRpcError {
    fn from(err: &ProtocolError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Log level for relayed log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A decoded frame: request, response or notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl From<JsonRpcRequest> for Message {
    fn from(request: JsonRpcRequest) -> Self {
        Self::Request(request)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(response: JsonRpcResponse) -> Self {
        Self::Response(response)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(notification: JsonRpcNotification) -> Self {
        Self::Notification(notification)
    }
}
