//! Method handlers and the request dispatcher.

use crate::error::{BridgeError, ProtocolError, SupervisorError};
use crate::protocol::types::*;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

/// Failure reported by a method handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("{message}")]
    Domain { code: i32, message: String },

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain {
            code: -32000,
            message: message.into(),
        }
    }

    /// Converts into the wire error object.
    pub fn to_error_object(&self) -> JsonRpcError {
        match self {
            Self::InvalidParams(message) => {
                (&ProtocolError::InvalidParams(message.clone().into())).into()
            }
            Self::Domain { code, message } => JsonRpcError::new(*code, message.clone()),
            Self::Internal(message) => (&ProtocolError::InternalError(message.clone().into())).into(),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl From<BridgeError> for HandlerError {
    fn from(err: BridgeError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<SupervisorError> for HandlerError {
    fn from(err: SupervisorError) -> Self {
        Self::domain(err.to_string())
    }
}

pub type HandlerResult<T = Value> = std::result::Result<T, HandlerError>;

/// Deserializes handler params, treating absent params as an empty object.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> HandlerResult<T> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| HandlerError::InvalidParams(e.to_string()))
}

/// Handler trait for a single method.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn call(&self, params: Value) -> HandlerResult<Value>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
{
    async fn call(&self, params: Value) -> HandlerResult<Value> {
        (self)(params).await
    }
}

/// Method dispatcher that routes messages to registered handlers.
pub struct Dispatcher {
    handlers: DashMap<String, Arc<dyn MethodHandler>>,
    subscribers: DashMap<String, Vec<Arc<dyn MethodHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    /// Registers the handler for requests to `method`, replacing any previous one.
    pub fn register<H: MethodHandler>(&self, method: impl Into<String>, handler: H) {
        let method = method.into();
        debug!("Registering method: {}", method);
        self.handlers.insert(method, Arc::new(handler));
    }

    /// Subscribes a side-effect handler to inbound notifications named `method`.
    pub fn subscribe<H: MethodHandler>(&self, method: impl Into<String>, handler: H) {
        self.subscribers
            .entry(method.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Registered request methods, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.iter().map(|r| r.key().clone()).collect();
        methods.sort();
        methods
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn handler(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(method).map(|r| Arc::clone(&*r))
    }

    /// Dispatches one inbound message.
    ///
    /// Returns the response to write, if any: idless requests, notifications
    /// and stray responses never produce output.
    pub async fn dispatch(&self, message: Message) -> Option<JsonRpcResponse> {
        match message {
            Message::Request(request) => self.handle_request(request).await,
            Message::Notification(notification) => {
                self.handle_notification(notification).await;
                None
            }
            Message::Response(response) => {
                warn!("Unexpected response received: {:?}", response.id);
                None
            }
        }
    }

    #[instrument(skip(self, request), fields(method = %request.method))]
    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!("Dispatching request: {}", request.method);

        let result = match self.handler(&request.method) {
            Some(handler) => invoke(handler, request.params.unwrap_or(Value::Null)).await,
            None => {
                warn!("Unknown method: {}", request.method);
                let response = JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::from(&ProtocolError::MethodNotFound(request.method.clone())),
                );
                return response.id.is_some().then_some(response);
            }
        };

        let response = match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => {
                error!("Request failed: {}", e);
                JsonRpcResponse::error(request.id, e.to_error_object())
            }
        };

        // No id to correlate with: executed for side effect only
        response.id.is_some().then_some(response)
    }

    #[instrument(skip(self, notification), fields(method = %notification.method))]
    async fn handle_notification(&self, notification: JsonRpcNotification) {
        let params = notification.params.unwrap_or(Value::Null);
        let subscribers = self
            .subscribers
            .get(&notification.method)
            .map(|r| r.value().clone())
            .unwrap_or_default();

        if subscribers.is_empty() {
            match self.handler(&notification.method) {
                Some(handler) => {
                    if let Err(e) = invoke(handler, params).await {
                        warn!("Notification handler failed: {}", e);
                    }
                }
                None => debug!("Ignoring notification: {}", notification.method),
            }
            return;
        }

        for subscriber in subscribers {
            if let Err(e) = invoke(subscriber, params.clone()).await {
                warn!("Notification subscriber failed: {}", e);
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a handler on its own task so that a panic is contained.
async fn invoke(handler: Arc<dyn MethodHandler>, params: Value) -> HandlerResult<Value> {
    match tokio::spawn(async move { handler.call(params).await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(HandlerError::Internal("handler panicked".into())),
        Err(e) => Err(HandlerError::Internal(e.to_string())),
    }
}
