//! In-process periodic worker.

use crate::error::SupervisorResult;
use crate::protocol::transport::Notifier;
use crate::protocol::types::JsonRpcNotification;
use crate::supervisor::state::{StateCell, TaskState};
use crate::supervisor::{StartOutcome, StopOutcome, Supervised, TaskKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a tick produced.
#[derive(Debug)]
pub enum Tick {
    /// Emit the notification and keep going.
    Event(JsonRpcNotification),
    /// The work is finished: emit `last` (if any), enter `stopped`, then emit
    /// `completion`.
    Done {
        last: Option<JsonRpcNotification>,
        completion: JsonRpcNotification,
    },
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    emit_gate: Arc<tokio::sync::Mutex<bool>>,
}

/// A worker that runs a tick closure at a fixed period.
///
/// The closure runs on the blocking pool, so it may do synchronous I/O.
/// Ticks that overrun the period delay the schedule rather than bunching up.
///
/// `stop` waits up to the grace period for the in-flight tick. Past that it
/// closes the emit gate the worker writes through, so no notification from
/// a stopped worker is written after `stop` returns. A tick still computing
/// at that point is discarded.
pub struct PeriodicTask {
    name: String,
    state: Arc<StateCell>,
    notifier: Notifier,
    stop_grace: Duration,
    worker: Mutex<Option<Worker>>,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>, notifier: Notifier, stop_grace: Duration) -> Self {
        let name = name.into();
        Self {
            state: Arc::new(StateCell::new(name.clone())),
            name,
            notifier,
            stop_grace,
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.state()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Starts the worker. `tick` receives the 1-based tick count.
    ///
    /// The first tick fires one `period` after the start.
    pub fn start<F>(&self, period: Duration, tick: F) -> StartOutcome
    where
        F: FnMut(u64) -> anyhow::Result<Tick> + Send + 'static,
    {
        let generation = match self.state.begin_start() {
            Ok(generation) => generation,
            Err(current) => {
                debug!(task = %self.name, state = %current, "start ignored");
                return StartOutcome::AlreadyRunning;
            }
        };

        self.state
            .compare_and_set(generation, TaskState::Starting, TaskState::Running);

        let cancel = CancellationToken::new();
        let emit_gate = Arc::new(tokio::sync::Mutex::new(false));
        let handle = tokio::spawn(run_worker(
            WorkerContext {
                name: self.name.clone(),
                state: Arc::clone(&self.state),
                notifier: self.notifier.clone(),
                generation,
                cancel: cancel.clone(),
                emit_gate: Arc::clone(&emit_gate),
            },
            period,
            tick,
        ));

        *self.worker.lock() = Some(Worker {
            cancel,
            handle,
            emit_gate,
        });
        info!(task = %self.name, period_ms = period.as_millis() as u64, "periodic task started");
        StartOutcome::Started
    }

    /// Cancels the worker and waits, up to the grace period, for its
    /// in-flight tick.
    pub async fn stop(&self) -> StopOutcome {
        let Some(generation) = self.state.begin_stop() else {
            return StopOutcome::NotRunning;
        };

        let worker = self.worker.lock().take();
        if let Some(Worker {
            cancel,
            mut handle,
            emit_gate,
        }) = worker
        {
            cancel.cancel();
            match tokio::time::timeout(self.stop_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = %self.name, "worker ended abnormally: {}", e),
                Err(_) => {
                    warn!(task = %self.name, "tick still running after grace, discarding it");
                    // Waits out an emission in progress; the worker exits on its own
                    *emit_gate.lock().await = true;
                }
            }
        }

        self.state
            .compare_and_set(generation, TaskState::Stopping, TaskState::Stopped);
        info!(task = %self.name, "periodic task stopped");
        StopOutcome::Stopped
    }
}

struct WorkerContext {
    name: String,
    state: Arc<StateCell>,
    notifier: Notifier,
    generation: u64,
    cancel: CancellationToken,
    emit_gate: Arc<tokio::sync::Mutex<bool>>,
}

async fn run_worker<F>(ctx: WorkerContext, period: Duration, tick: F)
where
    F: FnMut(u64) -> anyhow::Result<Tick> + Send + 'static,
{
    let WorkerContext {
        name,
        state,
        notifier,
        generation,
        cancel,
        emit_gate,
    } = ctx;
    let tick = Arc::new(Mutex::new(tick));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut count = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        count += 1;
        let step = Arc::clone(&tick);
        let produced = tokio::task::spawn_blocking(move || {
            let mut tick = step.lock();
            (*tick)(count)
        })
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("tick panicked: {e}")));

        let closed = emit_gate.lock().await;
        if *closed {
            debug!(task = %name, ticks = count, "discarding tick produced after stop");
            break;
        }
        match produced {
            Ok(Tick::Event(event)) => notifier.emit(event).await,
            Ok(Tick::Done { last, completion }) => {
                if let Some(event) = last {
                    notifier.emit(event).await;
                }
                if state.compare_and_set(generation, TaskState::Running, TaskState::Stopped) {
                    debug!(task = %name, ticks = count, "periodic task completed");
                    notifier.emit(completion).await;
                }
                break;
            }
            Err(e) => {
                error!(task = %name, "tick failed: {:#}", e);
                if state.fail(generation) {
                    notifier.error(format!("{name} failed: {e}")).await;
                }
                break;
            }
        }
    }
}

#[async_trait]
impl Supervised for PeriodicTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::InProcess
    }

    fn state(&self) -> TaskState {
        self.state.state()
    }

    async fn stop(&self) -> SupervisorResult<StopOutcome> {
        Ok(PeriodicTask::stop(self).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::capture;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    const PERIOD: Duration = Duration::from_millis(10);

    fn task() -> (PeriodicTask, crate::test_support::Frames) {
        let (sink, frames) = capture();
        (
            PeriodicTask::new("ticker", Notifier::new(sink), Duration::from_secs(1)),
            frames,
        )
    }

    fn counting(n: u64) -> anyhow::Result<Tick> {
        Ok(Tick::Event(JsonRpcNotification::event("tick", json!({"n": n}))))
    }

    #[tokio::test]
    async fn test_ticks_are_emitted_in_order() {
        let (task, mut frames) = task();
        assert_eq!(task.start(PERIOD, counting), StartOutcome::Started);

        for expected in 1..=3u64 {
            let event = frames.next_notification().await;
            assert_eq!(event.params.unwrap()["n"], expected);
        }
        assert_eq!(task.stop().await, StopOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_redundant_start_keeps_single_worker() {
        let (task, _frames) = task();
        assert_eq!(task.start(PERIOD, counting), StartOutcome::Started);
        assert_eq!(task.start(PERIOD, counting), StartOutcome::AlreadyRunning);
        assert_eq!(task.state(), TaskState::Running);
        task.stop().await;
    }

    #[tokio::test]
    async fn test_no_tick_after_stop() {
        let (task, mut frames) = task();
        task.start(PERIOD, counting);
        frames.next_notification().await;

        assert_eq!(task.stop().await, StopOutcome::Stopped);
        assert_eq!(task.state(), TaskState::Stopped);

        // Drain anything written before stop returned, then expect silence
        while frames.next_within(Duration::from_millis(5)).await.is_some() {}
        assert!(frames.next_within(PERIOD * 5).await.is_none());
    }

    #[tokio::test]
    async fn test_slow_tick_is_discarded_after_stop() {
        let (sink, mut frames) = capture();
        let task = PeriodicTask::new("slow", Notifier::new(sink), Duration::from_millis(50));
        let computed = Arc::new(AtomicU64::new(0));

        let seen = Arc::clone(&computed);
        task.start(PERIOD, move |n| {
            std::thread::sleep(Duration::from_millis(300));
            seen.fetch_add(1, Ordering::SeqCst);
            counting(n)
        });
        tokio::time::sleep(PERIOD * 3).await;

        let started = std::time::Instant::now();
        assert_eq!(task.stop().await, StopOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(task.state(), TaskState::Stopped);

        // The in-flight tick finishes but is never written
        assert!(frames.next_within(Duration::from_millis(500)).await.is_none());
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tick_panic_fails_task() {
        let (task, mut frames) = task();
        task.start(PERIOD, |_| -> anyhow::Result<Tick> { panic!("bad sensor") });

        let error = frames.next_notification().await;
        assert_eq!(error.method, "error");
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let (task, _frames) = task();
        assert_eq!(task.stop().await, StopOutcome::NotRunning);
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[tokio::test]
    async fn test_done_stops_and_completes() {
        let (task, mut frames) = task();
        task.start(PERIOD, |n| {
            if n < 2 {
                return counting(n);
            }
            Ok(Tick::Done {
                last: Some(JsonRpcNotification::event("tick", json!({"n": n}))),
                completion: JsonRpcNotification::event("complete", json!({})),
            })
        });

        assert_eq!(frames.next_notification().await.params.unwrap()["n"], 1);
        assert_eq!(frames.next_notification().await.params.unwrap()["n"], 2);
        let completion = frames.next_notification().await;
        assert_eq!(completion.params.unwrap()["type"], "complete");
        assert_eq!(task.state(), TaskState::Stopped);

        // Restartable after completion
        assert_eq!(task.start(PERIOD, counting), StartOutcome::Started);
        task.stop().await;
    }

    #[tokio::test]
    async fn test_tick_error_fails_task_once() {
        let (task, mut frames) = task();
        task.start(PERIOD, |_| Err(anyhow::anyhow!("sensor gone")));

        let error = frames.next_notification().await;
        assert_eq!(error.method, "error");
        assert!(
            error.params.unwrap()["message"]
                .as_str()
                .unwrap()
                .contains("sensor gone")
        );
        assert_eq!(task.state(), TaskState::Failed);
        assert!(frames.next_within(PERIOD * 5).await.is_none());
        assert_eq!(task.stop().await, StopOutcome::NotRunning);
    }
}
