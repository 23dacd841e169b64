//! JSON-RPC 2.0 over newline-delimited stdio.

pub mod codec;
pub mod handler;
pub mod server;
pub mod transport;
pub mod types;

pub use codec::{DecodeError, decode, encode};
pub use handler::{Dispatcher, HandlerError, HandlerResult, MethodHandler, parse_params};
pub use server::{
    BackendServer, BackendServerBuilder, RunOutcome, ServerState, ShutdownSignal, report_fatal,
    serve, shutdown_signal,
};
pub use transport::{LineTransport, Notifier, OutputSink, StdioTransport, Transport};
pub use types::*;
