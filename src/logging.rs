//! Tracing setup shared by the backend binaries.

use tracing_subscriber::{EnvFilter, fmt};

/// Installs the JSON subscriber on stderr. stdout carries protocol frames
/// only.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("booltox_bridge=info,warn"));

    // A second init (e.g. from tests) is ignored
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .try_init();
}
