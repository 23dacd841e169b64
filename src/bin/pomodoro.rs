//! Countdown timer backend.

use booltox_bridge::{
    Result,
    backends::TimerBackend,
    config::{ServerConfig, TimerConfig},
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
        .name("pomodoro")
        .from_env()?
        .build()?;
    let timer_config = TimerConfig::builder().from_env()?.build()?;

    let dispatcher = Dispatcher::new();
    let registry = SupervisorRegistry::new();
    TimerBackend::new(timer_config, Notifier::new(sink.clone())).install(&dispatcher, &registry)?;

    let server = BackendServer::builder()
        .config(&config)
        .dispatcher(Arc::new(dispatcher))
        .registry(Arc::new(registry))
        .build()?;
    Ok((server, config))
}
