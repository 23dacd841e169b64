//! System telemetry collaborator.
//!
//! The monitor backend samples metrics through [`TelemetrySource`]. Every
//! call is synchronous and may block on filesystem reads, so callers run it
//! on the blocking pool.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::ProcfsTelemetry;

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Ordering of the process list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessSort {
    #[default]
    Cpu,
    Memory,
}

/// Source of telemetry payloads.
pub trait TelemetrySource: Send + Sync {
    fn system_info(&self) -> anyhow::Result<Value>;

    /// CPU usage since the previous call (since boot on the first call).
    fn cpu(&self) -> anyhow::Result<Value>;

    fn memory(&self) -> anyhow::Result<Value>;

    fn disks(&self) -> anyhow::Result<Value>;

    /// Cumulative network counters.
    fn network(&self) -> anyhow::Result<Value>;

    fn processes(&self, sort: ProcessSort, limit: usize) -> anyhow::Result<Value>;

    /// A fresh source with its own delta baselines, for a consumer sampling
    /// on its own schedule.
    fn detached(&self) -> anyhow::Result<Arc<dyn TelemetrySource>>;
}

/// The telemetry source for this platform.
#[cfg(target_os = "linux")]
pub fn default_source() -> anyhow::Result<Arc<dyn TelemetrySource>> {
    Ok(Arc::new(ProcfsTelemetry::new()?))
}

#[cfg(not(target_os = "linux"))]
pub fn default_source() -> anyhow::Result<Arc<dyn TelemetrySource>> {
    anyhow::bail!("no telemetry source is available on this platform")
}
