//! System telemetry backend (`sysmon-backend`).

use super::rejected;
use crate::config::MonitorConfig;
use crate::error::SupervisorResult;
use crate::protocol::{
    Dispatcher, HandlerError, HandlerResult, JsonRpcNotification, Notifier, parse_params,
};
use crate::supervisor::{PeriodicTask, StopOutcome, SupervisorRegistry, Tick};
use crate::telemetry::{ProcessSort, TelemetrySource};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

pub const TASK_NAME: &str = "monitor";

const DEFAULT_PROCESS_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessParams {
    #[serde(default, alias = "sort_by")]
    sort_by: ProcessSort,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_PROCESS_LIMIT
}

/// On-demand telemetry queries plus a periodic `monitor_data` stream.
pub struct MonitorBackend {
    config: MonitorConfig,
    source: Arc<dyn TelemetrySource>,
    task: Arc<PeriodicTask>,
    notifier: Notifier,
}

impl MonitorBackend {
    pub fn new(
        config: MonitorConfig,
        source: Arc<dyn TelemetrySource>,
        notifier: Notifier,
    ) -> Arc<Self> {
        let task = Arc::new(PeriodicTask::new(
            TASK_NAME,
            notifier.clone(),
            config.stop_grace,
        ));
        Arc::new(Self {
            config,
            source,
            task,
            notifier,
        })
    }

    pub fn install(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
        registry: &SupervisorRegistry,
    ) -> SupervisorResult<()> {
        registry.register(self.task.clone())?;

        self.register_query(dispatcher, "getSystemInfo", |s| s.system_info());
        self.register_query(dispatcher, "getCpuInfo", |s| s.cpu());
        self.register_query(dispatcher, "getMemoryInfo", |s| s.memory());
        self.register_query(dispatcher, "getDiskInfo", |s| s.disks());
        self.register_query(dispatcher, "getNetworkInfo", |s| s.network());

        let monitor = Arc::clone(self);
        dispatcher.register("getProcesses", move |params: Value| {
            let monitor = Arc::clone(&monitor);
            async move {
                let params: ProcessParams = parse_params(params)?;
                monitor
                    .query(move |s| s.processes(params.sort_by, params.limit))
                    .await
            }
        });

        let monitor = Arc::clone(self);
        dispatcher.register("startMonitor", move |_params: Value| {
            let monitor = Arc::clone(&monitor);
            async move { Ok::<_, HandlerError>(monitor.start().await) }
        });

        let monitor = Arc::clone(self);
        dispatcher.register("stopMonitor", move |_params: Value| {
            let monitor = Arc::clone(&monitor);
            async move { Ok::<_, HandlerError>(monitor.stop().await) }
        });

        let monitor = Arc::clone(self);
        dispatcher.register("getMonitorStatus", move |_params: Value| {
            let monitor = Arc::clone(&monitor);
            async move { Ok::<_, HandlerError>(monitor.status()) }
        });

        Ok(())
    }

    fn register_query<F>(self: &Arc<Self>, dispatcher: &Dispatcher, method: &str, read: F)
    where
        F: Fn(&dyn TelemetrySource) -> anyhow::Result<Value> + Copy + Send + Sync + 'static,
    {
        let monitor = Arc::clone(self);
        dispatcher.register(method, move |_params: Value| {
            let monitor = Arc::clone(&monitor);
            async move { monitor.query(read).await }
        });
    }

    /// Runs a telemetry read off the async workers and wraps it as `{data}`.
    async fn query<F>(&self, read: F) -> HandlerResult
    where
        F: FnOnce(&dyn TelemetrySource) -> anyhow::Result<Value> + Send + 'static,
    {
        let source = Arc::clone(&self.source);
        let data = tokio::task::spawn_blocking(move || read(source.as_ref()))
            .await
            .map_err(|e| HandlerError::Internal(e.to_string()))??;
        Ok(json!({ "data": data }))
    }

    /// Starts the `monitor_data` stream on a detached telemetry source, so
    /// on-demand queries never move the stream's CPU baseline.
    pub async fn start(&self) -> Value {
        if !self.task.state().can_start() {
            return self.already_running().await;
        }
        let source = match self.source.detached() {
            Ok(source) => source,
            Err(e) => {
                warn!("telemetry unavailable for monitoring: {:#}", e);
                return rejected(&format!("Monitor unavailable: {e:#}"));
            }
        };

        let outcome = self.task.start(self.config.period, move |n| {
            let data = json!({
                "cpu": source.cpu()?,
                "memory": source.memory()?,
                "network": source.network()?,
                "timestamp": Utc::now().to_rfc3339(),
            });
            debug!(sample = n, "telemetry sampled");
            Ok(Tick::Event(JsonRpcNotification::event(
                "monitor_data",
                json!({ "data": data }),
            )))
        });

        if !outcome.is_success() {
            return self.already_running().await;
        }
        self.notifier
            .event(
                "monitor_started",
                json!({ "message": "Real-time monitoring started" }),
            )
            .await;
        json!({ "success": true })
    }

    async fn already_running(&self) -> Value {
        self.notifier
            .event("info", json!({ "message": "Monitor already running" }))
            .await;
        rejected("Monitor already running")
    }

    pub async fn stop(&self) -> Value {
        match self.task.stop().await {
            StopOutcome::Stopped => {
                self.notifier
                    .event(
                        "monitor_stopped",
                        json!({ "message": "Real-time monitoring stopped" }),
                    )
                    .await;
                json!({ "success": true })
            }
            StopOutcome::NotRunning => {
                self.notifier
                    .event("info", json!({ "message": "Monitor not running" }))
                    .await;
                rejected("Monitor not running")
            }
        }
    }

    pub fn status(&self) -> Value {
        json!({
            "isRunning": self.task.is_running(),
            "state": self.task.state(),
            "intervalMs": self.config.period.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;
    use crate::test_support::{Frames, capture};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const PERIOD: Duration = Duration::from_millis(10);

    #[derive(Default)]
    struct FakeSource {
        broken: Arc<AtomicBool>,
        detached: Arc<AtomicUsize>,
        cpu_reads: AtomicUsize,
    }

    impl TelemetrySource for FakeSource {
        fn system_info(&self) -> anyhow::Result<Value> {
            Ok(json!({"platform": "Linux", "cpu_count_logical": 4}))
        }

        fn cpu(&self) -> anyhow::Result<Value> {
            if self.broken.load(Ordering::SeqCst) {
                anyhow::bail!("/proc/stat unreadable");
            }
            self.cpu_reads.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"percent": 12.5, "percent_per_core": [10.0, 15.0]}))
        }

        fn memory(&self) -> anyhow::Result<Value> {
            Ok(json!({"total": 8192, "used": 4096, "percent": 50.0}))
        }

        fn disks(&self) -> anyhow::Result<Value> {
            Ok(json!([{"mountpoint": "/", "percent": 40.0}]))
        }

        fn network(&self) -> anyhow::Result<Value> {
            Ok(json!({"bytes_sent": 1, "bytes_recv": 2}))
        }

        fn processes(&self, sort: ProcessSort, limit: usize) -> anyhow::Result<Value> {
            let key = match sort {
                ProcessSort::Cpu => "cpu",
                ProcessSort::Memory => "memory",
            };
            Ok(json!({"sort": key, "limit": limit}))
        }

        fn detached(&self) -> anyhow::Result<Arc<dyn TelemetrySource>> {
            self.detached.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSource {
                broken: Arc::clone(&self.broken),
                detached: Arc::clone(&self.detached),
                cpu_reads: AtomicUsize::new(0),
            }))
        }
    }

    fn setup() -> (Arc<MonitorBackend>, Arc<FakeSource>, Dispatcher, Frames) {
        let (sink, frames) = capture();
        let source = Arc::new(FakeSource::default());
        let config = MonitorConfig::builder().period(PERIOD).build().unwrap();
        let monitor = MonitorBackend::new(config, source.clone(), Notifier::new(sink));
        let dispatcher = Dispatcher::new();
        monitor
            .install(&dispatcher, &SupervisorRegistry::new())
            .unwrap();
        (monitor, source, dispatcher, frames)
    }

    async fn call(dispatcher: &Dispatcher, method: &str, params: Value) -> Value {
        dispatcher
            .dispatch(
                JsonRpcRequest::new(method)
                    .with_id(1)
                    .with_params(params)
                    .into(),
            )
            .await
            .unwrap()
            .result
            .unwrap()
    }

    #[tokio::test]
    async fn test_queries_wrap_data() {
        let (_monitor, _source, dispatcher, _frames) = setup();

        let info = call(&dispatcher, "getSystemInfo", Value::Null).await;
        assert_eq!(info["data"]["platform"], "Linux");
        let memory = call(&dispatcher, "getMemoryInfo", Value::Null).await;
        assert_eq!(memory["data"]["percent"], 50.0);
        let disks = call(&dispatcher, "getDiskInfo", Value::Null).await;
        assert!(disks["data"].is_array());
    }

    #[tokio::test]
    async fn test_process_params() {
        let (_monitor, _source, dispatcher, _frames) = setup();

        let defaults = call(&dispatcher, "getProcesses", Value::Null).await;
        assert_eq!(defaults["data"], json!({"sort": "cpu", "limit": 10}));

        let custom = call(
            &dispatcher,
            "getProcesses",
            json!({"sortBy": "memory", "limit": 3}),
        )
        .await;
        assert_eq!(custom["data"], json!({"sort": "memory", "limit": 3}));

        let response = dispatcher
            .dispatch(
                JsonRpcRequest::new("getProcesses")
                    .with_id(2)
                    .with_params(json!({"sortBy": "name"}))
                    .into(),
            )
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_query_failure_is_error_response() {
        let (_monitor, source, dispatcher, _frames) = setup();
        source.broken.store(true, Ordering::SeqCst);

        let response = dispatcher
            .dispatch(JsonRpcRequest::new("getCpuInfo").with_id(3).into())
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32603);
        assert!(error.message.contains("/proc/stat unreadable"));
    }

    #[tokio::test]
    async fn test_monitor_stream_lifecycle() {
        let (_monitor, _source, dispatcher, mut frames) = setup();

        assert_eq!(
            call(&dispatcher, "startMonitor", Value::Null).await,
            json!({"success": true})
        );
        let started = frames.next_notification().await.params.unwrap();
        assert_eq!(started["type"], "monitor_started");

        for _ in 0..2 {
            let sample = frames.next_notification().await.params.unwrap();
            assert_eq!(sample["type"], "monitor_data");
            assert_eq!(sample["data"]["cpu"]["percent"], 12.5);
            assert!(sample["data"]["timestamp"].is_string());
        }

        let again = call(&dispatcher, "startMonitor", Value::Null).await;
        assert_eq!(
            again,
            json!({"success": false, "error": "Monitor already running"})
        );

        let status = call(&dispatcher, "getMonitorStatus", Value::Null).await;
        assert_eq!(status["isRunning"], true);
        assert_eq!(status["state"], "running");

        assert_eq!(
            call(&dispatcher, "stopMonitor", Value::Null).await,
            json!({"success": true})
        );
        let mut last = None;
        while let Some(frame) = frames.next_within(PERIOD * 3).await {
            last = Some(frame);
        }
        let Some(crate::protocol::Message::Notification(stopped)) = last else {
            panic!("expected monitor_stopped");
        };
        assert_eq!(stopped.params.unwrap()["type"], "monitor_stopped");

        assert_eq!(
            call(&dispatcher, "stopMonitor", Value::Null).await,
            json!({"success": false, "error": "Monitor not running"})
        );
    }

    #[tokio::test]
    async fn test_stream_samples_its_own_source() {
        let (monitor, source, dispatcher, mut frames) = setup();

        call(&dispatcher, "startMonitor", Value::Null).await;
        frames.next_notification().await;
        for _ in 0..2 {
            assert_eq!(
                frames.next_notification().await.params.unwrap()["type"],
                "monitor_data"
            );
        }
        assert_eq!(source.detached.load(Ordering::SeqCst), 1);
        assert_eq!(source.cpu_reads.load(Ordering::SeqCst), 0);

        call(&dispatcher, "getCpuInfo", Value::Null).await;
        assert_eq!(source.cpu_reads.load(Ordering::SeqCst), 1);

        // A rejected start does not detach another source
        call(&dispatcher, "startMonitor", Value::Null).await;
        assert_eq!(source.detached.load(Ordering::SeqCst), 1);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_sample_failure_fails_monitor() {
        let (monitor, source, dispatcher, mut frames) = setup();
        source.broken.store(true, Ordering::SeqCst);

        call(&dispatcher, "startMonitor", Value::Null).await;
        frames.next_notification().await;

        let error = frames.next_notification().await;
        assert_eq!(error.method, "error");
        assert_eq!(monitor.task.state(), crate::supervisor::TaskState::Failed);

        // A failed monitor can be started again
        source.broken.store(false, Ordering::SeqCst);
        assert_eq!(
            call(&dispatcher, "startMonitor", Value::Null).await["success"],
            true
        );
        monitor.stop().await;
    }
}
