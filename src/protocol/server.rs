//! Backend host loop with lifecycle management.

use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::codec::decode;
use crate::protocol::handler::Dispatcher;
use crate::protocol::transport::{OutputSink, StdioTransport, Transport};
use crate::protocol::types::*;
use crate::supervisor::SupervisorRegistry;
use std::future::Future;
use std::pin::Pin;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type StartupHook = Box<dyn FnOnce() -> BoxFuture + Send>;

/// How long teardown waits for an unfinished after-ready hook.
const HOOK_GRACE: Duration = Duration::from_secs(5);

/// Server state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Server created but not started.
    Created,
    /// `$ready` sent, serving requests.
    Running,
    /// Tearing down supervised tasks.
    ShuttingDown,
    /// Server has stopped.
    Stopped,
}

/// Signal that interrupted the host loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }
}

/// How the host loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    EndOfInput,
    Interrupted(ShutdownSignal),
}

/// Name and version announced in `$ready`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// A backend process: reads frames from the host, dispatches them and owns
/// the supervised tasks it tears down on exit.
pub struct BackendServer {
    info: ServerInfo,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SupervisorRegistry>,
    startup: parking_lot::Mutex<Vec<StartupHook>>,
    hooks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    state: RwLock<ServerState>,
    torn_down: AtomicBool,
}

impl BackendServer {
    pub fn builder() -> BackendServerBuilder {
        BackendServerBuilder::new()
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Get current server state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Run the server on stdio until end of input or a termination signal.
    #[instrument(skip(self), fields(server = %self.info.name))]
    pub async fn run(self) -> Result<RunOutcome> {
        let transport = Arc::new(StdioTransport::stdio());
        self.run_until(transport, shutdown_signal()).await
    }

    /// Run the server with a custom transport, stopping on termination signals.
    pub async fn run_with_transport<T: Transport + 'static>(
        self,
        transport: Arc<T>,
    ) -> Result<RunOutcome> {
        self.run_until(transport, shutdown_signal()).await
    }

    /// Run the server until end of input or until `shutdown` resolves.
    ///
    /// Supervised tasks are torn down exactly once, whichever way the loop
    /// ends.
    pub async fn run_until<T, S>(self, transport: Arc<T>, shutdown: S) -> Result<RunOutcome>
    where
        T: Transport + 'static,
        S: Future<Output = ShutdownSignal>,
    {
        info!(
            "Starting backend: {} v{}",
            self.info.name, self.info.version
        );
        let sink = transport.sink();

        let ready = JsonRpcNotification::ready(&self.info.version, &self.dispatcher.methods());
        if let Err(e) = sink.notify(ready).await {
            self.teardown().await;
            return Err(e);
        }
        *self.state.write().await = ServerState::Running;

        let startup = std::mem::take(&mut *self.startup.lock());
        let spawned: Vec<_> = startup.into_iter().map(|hook| tokio::spawn(hook())).collect();
        self.hooks.lock().extend(spawned);

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                biased;
                signal = &mut shutdown => {
                    info!("Received {}, shutting down", signal.name());
                    break Ok(RunOutcome::Interrupted(signal));
                }
                frame = transport.read_frame() => match frame {
                    Ok(Some(line)) => self.process_line(&line, &sink).await,
                    Ok(None) => {
                        debug!("EOF received, shutting down");
                        break Ok(RunOutcome::EndOfInput);
                    }
                    Err(e) => {
                        error!("Transport error: {}", e);
                        break Err(e);
                    }
                },
            }
        };

        self.teardown().await;
        info!("Server stopped");
        outcome
    }

    async fn process_line(&self, line: &str, sink: &OutputSink) {
        let message = match decode(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Rejected frame: {}", e);
                if let Err(e) = sink.send(&e.report()).await {
                    error!("Failed to send error report: {}", e);
                }
                return;
            }
        };

        if let Some(response) = self.dispatcher.dispatch(message).await
            && let Err(e) = sink.respond(response).await
        {
            error!("Failed to send response: {}", e);
        }
    }

    /// Stops every supervised task. Runs at most once.
    ///
    /// After-ready hooks are awaited first, so a task a hook starts late is
    /// still stopped.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.write().await = ServerState::ShuttingDown;

        let hooks = std::mem::take(&mut *self.hooks.lock());
        for mut hook in hooks {
            match tokio::time::timeout(HOOK_GRACE, &mut hook).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Startup hook ended abnormally: {}", e),
                Err(_) => {
                    warn!("Startup hook still running after {:?}, aborting", HOOK_GRACE);
                    hook.abort();
                }
            }
        }

        self.registry.shutdown_all().await;
        *self.state.write().await = ServerState::Stopped;
    }
}

/// Builder for [`BackendServer`].
pub struct BackendServerBuilder {
    name: String,
    version: String,
    dispatcher: Option<Arc<Dispatcher>>,
    registry: Option<Arc<SupervisorRegistry>>,
    startup: Vec<StartupHook>,
}

impl BackendServerBuilder {
    pub fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            dispatcher: None,
            registry: None,
            startup: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn config(self, config: &ServerConfig) -> Self {
        self.name(config.name.clone()).version(config.version.clone())
    }

    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn registry(mut self, registry: Arc<SupervisorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Work spawned right after `$ready` has been written.
    pub fn after_ready<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.startup
            .push(Box::new(move || Box::pin(hook()) as BoxFuture));
        self
    }

    pub fn build(self) -> Result<BackendServer> {
        let dispatcher = self.dispatcher.ok_or_else(|| BridgeError::Internal {
            message: "Dispatcher is required".into(),
        })?;

        Ok(BackendServer {
            info: ServerInfo {
                name: self.name,
                version: self.version,
            },
            dispatcher,
            registry: self.registry.unwrap_or_default(),
            startup: parking_lot::Mutex::new(self.startup),
            hooks: parking_lot::Mutex::new(Vec::new()),
            state: RwLock::new(ServerState::Created),
            torn_down: AtomicBool::new(false),
        })
    }
}

impl Default for BackendServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut interrupt), Ok(mut terminate)) => tokio::select! {
                _ = interrupt.recv() => ShutdownSignal::Interrupt,
                _ = terminate.recv() => ShutdownSignal::Terminate,
            },
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                std::future::pending().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::Interrupt,
            Err(e) => {
                warn!("Failed to install Ctrl-C handler: {}", e);
                std::future::pending().await
            }
        }
    }
}

/// Runs `server` on stdio and maps the outcome to the process exit code.
///
/// End of input exits 0. A signal emits an `exit` notification and exits with
/// the configured interrupt code. A fatal error emits an `error` notification
/// and exits 1.
pub async fn serve(server: BackendServer, config: &ServerConfig) -> ExitCode {
    let sink = OutputSink::stdout();
    match server.run().await {
        Ok(RunOutcome::EndOfInput) => {
            info!("Input closed, exiting");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Interrupted(signal)) => {
            let message = format!("Backend stopped by {}", signal.name());
            if let Err(e) = sink.notify(JsonRpcNotification::exit(message)).await {
                debug!("Failed to send exit notification: {}", e);
            }
            ExitCode::from(config.interrupt_exit_code)
        }
        Err(e) => {
            report_fatal(&sink, &e).await;
            ExitCode::FAILURE
        }
    }
}

/// Writes a final `error` notification for an unrecoverable failure.
pub async fn report_fatal(sink: &OutputSink, err: &BridgeError) {
    error!("Fatal error: {}", err);
    if let Err(e) = sink.notify(JsonRpcNotification::error(err.to_string())).await {
        debug!("Failed to send error notification: {}", e);
    }
}
