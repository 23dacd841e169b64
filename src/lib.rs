//! Supervised JSON-RPC backends for desktop tool plugins.
//!
//! Each backend binary speaks newline-delimited JSON-RPC 2.0 on stdio and
//! runs its background work under a [`supervisor`]: a countdown timer, a
//! telemetry sampler, or an external HTTP service.
//!
//! # Example
//!
//! ```no_run
//! use booltox_bridge::{
//!     backends::TimerBackend,
//!     config::{ServerConfig, TimerConfig},
//!     protocol::{BackendServer, Dispatcher, Notifier, OutputSink, serve},
//!     supervisor::SupervisorRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let sink = OutputSink::stdout();
//!     let dispatcher = Dispatcher::new();
//!     let registry = SupervisorRegistry::new();
//!
//!     let timer = TimerBackend::new(TimerConfig::default(), Notifier::new(sink));
//!     timer.install(&dispatcher, &registry)?;
//!
//!     let config = ServerConfig::default();
//!     let server = BackendServer::builder()
//!         .config(&config)
//!         .dispatcher(Arc::new(dispatcher))
//!         .registry(Arc::new(registry))
//!         .build()?;
//!
//!     serve(server, &config).await;
//!     Ok(())
//! }
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod supervisor;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use config::{MonitorConfig, ServerConfig, ServiceConfig, TimerConfig};
pub use error::{BridgeError, Result};
pub use protocol::{BackendServer, BackendServerBuilder, Dispatcher, Notifier, OutputSink};
pub use supervisor::{PeriodicTask, ProcessSupervisor, SupervisorRegistry, TaskState};
