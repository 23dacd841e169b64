//! Supervision of background work.
//!
//! Two kinds of task are supported: in-process periodic workers
//! ([`PeriodicTask`]) and external processes with readiness probing
//! ([`ProcessSupervisor`]). Both share the [`TaskState`] machine and are
//! torn down together through the [`SupervisorRegistry`].

pub mod periodic;
pub mod probe;
pub mod process;
pub mod state;

pub use periodic::{PeriodicTask, Tick};
pub use probe::{Endpoint, HttpProbe, ProbeOutcome, ProbePolicy, ReadinessProbe, TcpProbe};
pub use process::{ProcessSupervisor, ServiceSpec, ServiceStatus};
pub use state::{Snapshot, StateCell, TaskState};

use crate::error::{SupervisorError, SupervisorResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Kind of supervised work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    InProcess,
    ExternalProcess,
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Worker launched and running.
    Started,
    /// Process spawned; readiness is reported later.
    Starting,
    /// An already-healthy endpoint was taken over instead of spawning.
    Adopted,
    AlreadyRunning,
    /// A stop arrived while the start was still in progress.
    Superseded,
}

impl StartOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, Self::AlreadyRunning | Self::Superseded)
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// Common surface of every supervised task.
#[async_trait]
pub trait Supervised: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TaskKind;

    fn state(&self) -> TaskState;

    /// Stops the task, waiting for its worker to finish.
    async fn stop(&self) -> SupervisorResult<StopOutcome>;
}

/// Registry of every task a backend owns.
pub struct SupervisorRegistry {
    tasks: DashMap<String, Arc<dyn Supervised>>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    pub fn register(&self, task: Arc<dyn Supervised>) -> SupervisorResult<()> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(SupervisorError::AlreadyRegistered(name));
        }
        debug!(task = %name, kind = ?task.kind(), "registering task");
        self.tasks.insert(name, task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Supervised>> {
        self.tasks.get(name).map(|r| Arc::clone(&*r))
    }

    pub async fn stop(&self, name: &str) -> SupervisorResult<StopOutcome> {
        let task = self
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownTask(name.to_string()))?;
        task.stop().await
    }

    /// Name and state of every registered task, sorted by name.
    pub fn statuses(&self) -> Vec<(String, TaskState)> {
        let mut statuses: Vec<_> = self
            .tasks
            .iter()
            .map(|r| (r.key().clone(), r.value().state()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stops every task. Failures are logged and do not stop the sweep.
    pub async fn shutdown_all(&self) {
        // Collect first: no map guard may be held across an await
        let tasks: Vec<Arc<dyn Supervised>> =
            self.tasks.iter().map(|r| Arc::clone(r.value())).collect();

        for task in tasks {
            match task.stop().await {
                Ok(StopOutcome::Stopped) => info!(task = %task.name(), "task stopped"),
                Ok(StopOutcome::NotRunning) => {}
                Err(e) => warn!(task = %task.name(), "failed to stop task: {}", e),
            }
        }
    }
}

impl Default for SupervisorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeTask {
        name: String,
        state: Mutex<TaskState>,
        fail_stop: bool,
    }

    impl FakeTask {
        fn new(name: &str, state: TaskState, fail_stop: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                state: Mutex::new(state),
                fail_stop,
            })
        }
    }

    #[async_trait]
    impl Supervised for FakeTask {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> TaskKind {
            TaskKind::InProcess
        }

        fn state(&self) -> TaskState {
            *self.state.lock()
        }

        async fn stop(&self) -> SupervisorResult<StopOutcome> {
            if self.fail_stop {
                return Err(SupervisorError::Signal {
                    pid: 1,
                    message: "denied".into(),
                });
            }
            let mut state = self.state.lock();
            if !state.is_active() {
                return Ok(StopOutcome::NotRunning);
            }
            *state = TaskState::Stopped;
            Ok(StopOutcome::Stopped)
        }
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = SupervisorRegistry::new();
        registry
            .register(FakeTask::new("timer", TaskState::Idle, false))
            .unwrap();
        let err = registry
            .register(FakeTask::new("timer", TaskState::Idle, false))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRegistered(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_continues_past_failures() {
        let registry = SupervisorRegistry::new();
        let a = FakeTask::new("a", TaskState::Running, true);
        let b = FakeTask::new("b", TaskState::Running, false);
        registry.register(a).unwrap();
        registry.register(b.clone()).unwrap();

        registry.shutdown_all().await;
        assert_eq!(b.state(), TaskState::Stopped);
        assert_eq!(
            registry.statuses(),
            vec![
                ("a".to_string(), TaskState::Running),
                ("b".to_string(), TaskState::Stopped)
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_task() {
        let registry = SupervisorRegistry::new();
        assert!(matches!(
            registry.stop("ghost").await,
            Err(SupervisorError::UnknownTask(_))
        ));
    }
}
