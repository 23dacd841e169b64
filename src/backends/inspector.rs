//! UI inspection service backend (`uiautodev-backend`).

use super::rejected;
use crate::config::ServiceConfig;
use crate::error::SupervisorResult;
use crate::protocol::{Dispatcher, HandlerError, Notifier, parse_params};
use crate::supervisor::{ProcessSupervisor, StartOutcome, SupervisorRegistry};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

pub const TASK_NAME: &str = "uiautodev";

/// Notification kind announcing the service's readiness.
pub const READY_EVENT: &str = "serverReady";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusParams {
    probe: bool,
}

/// Fronts the external inspection service.
pub struct InspectorBackend {
    service: Arc<ProcessSupervisor>,
}

impl InspectorBackend {
    pub fn new(config: &ServiceConfig, notifier: Notifier) -> SupervisorResult<Arc<Self>> {
        let service = ProcessSupervisor::new(TASK_NAME, config.service_spec(READY_EVENT), notifier)?;
        Ok(Self::with_supervisor(service))
    }

    pub fn with_supervisor(service: ProcessSupervisor) -> Arc<Self> {
        Arc::new(Self {
            service: Arc::new(service),
        })
    }

    pub fn install(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
        registry: &SupervisorRegistry,
    ) -> SupervisorResult<()> {
        registry.register(self.service.clone())?;

        let inspector = Arc::clone(self);
        dispatcher.register("getServerUrl", move |_params: Value| {
            let inspector = Arc::clone(&inspector);
            async move { Ok::<_, HandlerError>(json!({ "url": inspector.service.url() })) }
        });

        let inspector = Arc::clone(self);
        dispatcher.register("getServerStatus", move |params: Value| {
            let inspector = Arc::clone(&inspector);
            async move {
                let params: StatusParams = parse_params(params)?;
                let status = inspector.service.status(params.probe).await;
                Ok::<_, HandlerError>(json!({
                    "running": status.running,
                    "state": status.state,
                    "url": status.url,
                    "pid": status.pid,
                    "adopted": status.adopted,
                }))
            }
        });

        let inspector = Arc::clone(self);
        dispatcher.register("startServer", move |_params: Value| {
            let inspector = Arc::clone(&inspector);
            async move {
                let outcome = inspector.service.start().await;
                Ok::<_, HandlerError>(inspector.start_result(outcome))
            }
        });

        let inspector = Arc::clone(self);
        dispatcher.register("restartServer", move |_params: Value| {
            let inspector = Arc::clone(&inspector);
            async move {
                let outcome = inspector.service.restart().await;
                Ok::<_, HandlerError>(inspector.start_result(outcome))
            }
        });

        let inspector = Arc::clone(self);
        dispatcher.register("shutdown", move |_params: Value| {
            let inspector = Arc::clone(&inspector);
            async move {
                inspector.service.stop().await?;
                Ok::<_, HandlerError>(json!({ "success": true }))
            }
        });

        Ok(())
    }

    /// Starts the service at boot. Failures are already announced through
    /// the ready event, so they are only logged here.
    pub async fn autostart(&self) {
        if let Err(e) = self.service.start().await {
            warn!("{} did not start: {}", TASK_NAME, e);
        }
    }

    fn start_result(&self, outcome: SupervisorResult<StartOutcome>) -> Value {
        let state = self.service.state();
        let url = self.service.url();
        match outcome {
            Ok(StartOutcome::AlreadyRunning) => {
                let mut result = rejected("Server already running");
                result["state"] = json!(state);
                result["url"] = json!(url);
                result
            }
            Ok(StartOutcome::Superseded) => {
                let mut result = rejected("Server start interrupted by shutdown");
                result["state"] = json!(state);
                result["url"] = json!(url);
                result
            }
            Ok(_) => json!({ "success": true, "state": state, "url": url }),
            Err(e) => json!({
                "success": false,
                "state": state,
                "url": url,
                "error": e.to_string(),
            }),
        }
    }
}
