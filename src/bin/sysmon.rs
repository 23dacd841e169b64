//! System telemetry backend.

use booltox_bridge::{
    BridgeError, Result,
    backends::MonitorBackend,
    config::{MonitorConfig, ServerConfig},
    logging::init_tracing,
    protocol::{BackendServer, Dispatcher, Notifier, OutputSink, report_fatal, serve},
    supervisor::SupervisorRegistry,
    telemetry,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let sink = OutputSink::stdout();
    match build(&sink) {
        Ok((server, config)) => serve(server, &config).await,
        Err(e) => {
            report_fatal(&sink, &e).await;
            ExitCode::FAILURE
        }
    }
}

fn build(sink: &OutputSink) -> Result<(BackendServer, ServerConfig)> {
    let config = ServerConfig::builder()
        .name("sysmon")
        .from_env()?
        .build()?;
    let monitor_config = MonitorConfig::builder().from_env()?.build()?;

    let source = telemetry::default_source().map_err(|e| {
        BridgeError::FatalStartup(format!("telemetry unavailable: {e:#}").into())
    })?;

    let dispatcher = Dispatcher::new();
    let registry = SupervisorRegistry::new();
    MonitorBackend::new(monitor_config, source, Notifier::new(sink.clone()))
        .install(&dispatcher, &registry)?;

    let server = BackendServer::builder()
        .config(&config)
        .dispatcher(Arc::new(dispatcher))
        .registry(Arc::new(registry))
        .build()?;
    Ok((server, config))
}
