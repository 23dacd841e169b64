//! Guarded lifecycle state of a supervised task.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Lifecycle state of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl TaskState {
    /// A worker may be live in this state.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Failed)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Idle | Stopped | Failed, Starting)
                | (Starting, Running)
                | (Starting | Running, Stopping)
                | (Starting | Running, Failed)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State plus the generation of the worker it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub state: TaskState,
    pub generation: u64,
}

/// Mutex-guarded task state.
///
/// Every start bumps the generation. Workers transition the cell only for the
/// generation they were started with, so a stale worker never touches a
/// restarted task.
pub struct StateCell {
    name: String,
    inner: Mutex<Snapshot>,
}

impl StateCell {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Snapshot {
                state: TaskState::Idle,
                generation: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.inner.lock()
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Enters `starting` and returns the new generation, or the current
    /// state when a worker may still be live.
    pub fn begin_start(&self) -> Result<u64, TaskState> {
        let mut inner = self.inner.lock();
        if !inner.state.can_start() {
            return Err(inner.state);
        }
        inner.generation += 1;
        inner.state = TaskState::Starting;
        debug!(task = %self.name, generation = inner.generation, "task starting");
        Ok(inner.generation)
    }

    /// Enters `stopping` from `starting` or `running`.
    pub fn begin_stop(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        if !inner.state.is_active() {
            return None;
        }
        inner.state = TaskState::Stopping;
        debug!(task = %self.name, generation = inner.generation, "task stopping");
        Some(inner.generation)
    }

    /// Moves `expected -> next` if the generation still matches.
    pub fn compare_and_set(&self, generation: u64, expected: TaskState, next: TaskState) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation
            || inner.state != expected
            || !expected.can_transition_to(next)
        {
            return false;
        }
        inner.state = next;
        debug!(task = %self.name, generation, from = %expected, to = %next, "task transition");
        true
    }

    /// Moves an active task of this generation to `failed`.
    pub fn fail(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation || !inner.state.is_active() {
            return false;
        }
        debug!(task = %self.name, generation, from = %inner.state, "task failed");
        inner.state = TaskState::Failed;
        true
    }
}
