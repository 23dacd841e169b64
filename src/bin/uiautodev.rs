//! Backend fronting the uiautodev inspection service.

use booltox_bridge::{
    Result,
    backends::InspectorBackend,
    config::{ServerConfig, ServiceConfig},
    logging::init_tracing,
    protocol::{BackendServer, Dispatcher, Notifier, OutputSink, report_fatal, serve},
    supervisor::SupervisorRegistry,
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
        .name("uiautodev")
        .from_env()?
        .build()?;
    let service_config = ServiceConfig::builder().from_env()?.build()?;
    info!(
        "Service endpoint http://{}:{}",
        service_config.host, service_config.port
    );

    let dispatcher = Dispatcher::new();
    let registry = SupervisorRegistry::new();
    let inspector = InspectorBackend::new(&service_config, Notifier::new(sink.clone()))?;
    inspector.install(&dispatcher, &registry)?;

    // The service is launched once `$ready` is out, so `serverReady` follows it
    let server = BackendServer::builder()
        .config(&config)
        .dispatcher(Arc::new(dispatcher))
        .registry(Arc::new(registry))
        .after_ready(move || async move { inspector.autostart().await })
        .build()?;
    Ok((server, config))
}
