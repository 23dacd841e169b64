//! Error types for the bridge.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.

use std::borrow::Cow;
use thiserror::Error;

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Startup failed: {0}")]
    FatalStartup(Cow<'static, str>),

    #[error("Internal error: {message}")]
    Internal { message: Cow<'static, str> },
}

/// JSON-RPC 2.0 protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Parse error: {0}")]
    ParseError(Cow<'static, str>),

    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(Cow<'static, str>),

    #[error("Internal error: {0}")]
    InternalError(Cow<'static, str>),

    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),
}

impl ProtocolError {
    /// Returns the JSON-RPC 2.0 error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError(_) => -32700,
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::InternalError(_) => -32603,
            Self::Transport(_) => -32000,
        }
    }
}

/// Errors raised while supervising background work.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("Service not ready after {0}ms")]
    ReadinessTimeout(u64),

    #[error("Process exited unexpectedly: {0}")]
    ChildExited(String),

    #[error("Task already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Process IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },
}

/// Result type alias for BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Result type alias for SupervisorError.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
