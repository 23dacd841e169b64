//! Countdown timer backend (`pomodoro-backend`).

use super::rejected;
use crate::config::TimerConfig;
use crate::error::SupervisorResult;
use crate::protocol::{Dispatcher, HandlerError, JsonRpcNotification, Notifier, parse_params};
use crate::supervisor::{PeriodicTask, StopOutcome, SupervisorRegistry, Tick};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

pub const TASK_NAME: &str = "timer";

#[derive(Debug, Default, Deserialize)]
struct StartParams {
    duration: Option<u64>,
}

#[derive(Debug)]
struct Countdown {
    duration: u64,
    remaining: u64,
    start_time: Option<DateTime<Utc>>,
}

/// A one-second countdown with pause and reset.
///
/// `start` without a duration resumes a paused countdown, or restarts the
/// full duration once it has completed.
pub struct TimerBackend {
    config: TimerConfig,
    task: Arc<PeriodicTask>,
    countdown: Arc<Mutex<Countdown>>,
    notifier: Notifier,
}

impl TimerBackend {
    pub fn new(config: TimerConfig, notifier: Notifier) -> Arc<Self> {
        let task = Arc::new(PeriodicTask::new(
            TASK_NAME,
            notifier.clone(),
            config.stop_grace,
        ));
        Arc::new(Self {
            countdown: Arc::new(Mutex::new(Countdown {
                duration: config.duration,
                remaining: config.duration,
                start_time: None,
            })),
            config,
            task,
            notifier,
        })
    }

    /// Registers `start`, `pause`, `reset` and `getStatus`, and the
    /// countdown task for teardown.
    pub fn install(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
        registry: &SupervisorRegistry,
    ) -> SupervisorResult<()> {
        registry.register(self.task.clone())?;

        let timer = Arc::clone(self);
        dispatcher.register("start", move |params: Value| {
            let timer = Arc::clone(&timer);
            async move {
                let params: StartParams = parse_params(params)?;
                Ok::<_, HandlerError>(timer.start(params.duration))
            }
        });

        let timer = Arc::clone(self);
        dispatcher.register("pause", move |_params: Value| {
            let timer = Arc::clone(&timer);
            async move { Ok::<_, HandlerError>(timer.pause().await) }
        });

        let timer = Arc::clone(self);
        dispatcher.register("reset", move |_params: Value| {
            let timer = Arc::clone(&timer);
            async move { Ok::<_, HandlerError>(timer.reset().await) }
        });

        let timer = Arc::clone(self);
        dispatcher.register("getStatus", move |_params: Value| {
            let timer = Arc::clone(&timer);
            async move { Ok::<_, HandlerError>(timer.status()) }
        });

        Ok(())
    }

    pub fn start(&self, duration: Option<u64>) -> Value {
        let mut countdown = self.countdown.lock();
        if !self.task.state().can_start() {
            return rejected("Timer already running");
        }

        match duration.filter(|d| *d > 0) {
            Some(duration) => {
                countdown.duration = duration;
                countdown.remaining = duration;
            }
            None if countdown.remaining == 0 => countdown.remaining = countdown.duration,
            None => {}
        }
        countdown.start_time = Some(Utc::now());
        let remaining = countdown.remaining;

        let state = Arc::clone(&self.countdown);
        let outcome = self.task.start(self.config.period, move |_| {
            let mut countdown = state.lock();
            countdown.remaining = countdown.remaining.saturating_sub(1);
            let tick = JsonRpcNotification::event(
                "tick",
                json!({
                    "remaining": countdown.remaining,
                    "total": countdown.duration,
                }),
            );
            if countdown.remaining > 0 {
                return Ok(Tick::Event(tick));
            }
            Ok(Tick::Done {
                last: Some(tick),
                completion: JsonRpcNotification::event("complete", Value::Null),
            })
        });
        drop(countdown);

        if !outcome.is_success() {
            return rejected("Timer already running");
        }
        info!(remaining, "countdown started");
        json!({ "success": true, "remaining": remaining })
    }

    pub async fn pause(&self) -> Value {
        match self.task.stop().await {
            StopOutcome::Stopped => {
                let remaining = self.countdown.lock().remaining;
                info!(remaining, "countdown paused");
                json!({ "success": true, "remaining": remaining })
            }
            StopOutcome::NotRunning => rejected("Timer not running"),
        }
    }

    /// Stops the countdown if needed and restores the full duration.
    pub async fn reset(&self) -> Value {
        self.task.stop().await;
        let remaining = {
            let mut countdown = self.countdown.lock();
            countdown.remaining = countdown.duration;
            countdown.start_time = None;
            countdown.remaining
        };
        self.notifier
            .event("reset", json!({ "remaining": remaining }))
            .await;
        json!({ "success": true, "remaining": remaining })
    }

    pub fn status(&self) -> Value {
        let countdown = self.countdown.lock();
        json!({
            "isRunning": self.task.is_running(),
            "remaining": countdown.remaining,
            "duration": countdown.duration,
            "startTime": countdown.start_time.map(|t| t.to_rfc3339()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcRequest, RequestId};
    use crate::test_support::{Frames, capture};
    use std::time::Duration;

    const PERIOD: Duration = Duration::from_millis(10);

    fn setup() -> (Arc<TimerBackend>, Dispatcher, SupervisorRegistry, Frames) {
        let (sink, frames) = capture();
        let config = TimerConfig::builder()
            .duration(60)
            .period(PERIOD)
            .build()
            .unwrap();
        let timer = TimerBackend::new(config, Notifier::new(sink));
        let dispatcher = Dispatcher::new();
        let registry = SupervisorRegistry::new();
        timer.install(&dispatcher, &registry).unwrap();
        (timer, dispatcher, registry, frames)
    }

    async fn call(dispatcher: &Dispatcher, id: i64, method: &str, params: Value) -> Value {
        let response = dispatcher
            .dispatch(
                JsonRpcRequest::new(method)
                    .with_id(id)
                    .with_params(params)
                    .into(),
            )
            .await
            .unwrap();
        assert_eq!(response.id, Some(RequestId::Number(id)));
        response.result.unwrap()
    }

    #[tokio::test]
    async fn test_install_registers_methods_and_task() {
        let (_timer, dispatcher, registry, _frames) = setup();
        assert_eq!(
            dispatcher.methods(),
            vec!["getStatus", "pause", "reset", "start"]
        );
        assert!(registry.get(TASK_NAME).is_some());
    }

    #[tokio::test]
    async fn test_countdown_to_completion() {
        let (_timer, dispatcher, _registry, mut frames) = setup();

        let result = call(&dispatcher, 1, "start", json!({"duration": 5})).await;
        assert_eq!(result, json!({"success": true, "remaining": 5}));

        for expected in (0..5u64).rev() {
            let tick = frames.next_notification().await;
            assert_eq!(tick.method, "$event");
            let params = tick.params.unwrap();
            assert_eq!(params["type"], "tick");
            assert_eq!(params["remaining"], expected);
            assert_eq!(params["total"], 5);
        }

        let complete = frames.next_notification().await;
        assert_eq!(complete.params, Some(json!({"type": "complete"})));
        assert!(frames.next_within(PERIOD * 5).await.is_none());

        let status = call(&dispatcher, 2, "getStatus", Value::Null).await;
        assert_eq!(status["isRunning"], false);
        assert_eq!(status["remaining"], 0);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (timer, dispatcher, _registry, mut frames) = setup();

        let first = call(&dispatcher, 1, "start", json!({"duration": 3})).await;
        assert_eq!(first["success"], true);
        let second = call(&dispatcher, 2, "start", json!({"duration": 3})).await;
        assert_eq!(
            second,
            json!({"success": false, "error": "Timer already running"})
        );

        // One stream: remaining 2, 1, 0 then complete
        for expected in [2u64, 1, 0] {
            let params = frames.next_notification().await.params.unwrap();
            assert_eq!(params["remaining"], expected);
        }
        assert_eq!(
            frames.next_notification().await.params.unwrap()["type"],
            "complete"
        );
        assert!(frames.next_within(PERIOD * 5).await.is_none());
        assert!(!timer.task.is_running());
    }

    #[tokio::test]
    async fn test_pause_then_resume() {
        let (timer, dispatcher, _registry, mut frames) = setup();

        call(&dispatcher, 1, "start", json!({"duration": 10})).await;
        frames.next_notification().await;

        let paused = call(&dispatcher, 2, "pause", Value::Null).await;
        assert_eq!(paused["success"], true);
        let remaining = paused["remaining"].as_u64().unwrap();
        assert!(remaining < 10);
        while frames.next_within(Duration::from_millis(5)).await.is_some() {}
        assert!(frames.next_within(PERIOD * 3).await.is_none());
        assert_eq!(timer.status()["remaining"], remaining);

        let resumed = call(&dispatcher, 3, "start", Value::Null).await;
        assert_eq!(resumed["remaining"], remaining);
        let tick = frames.next_notification().await.params.unwrap();
        assert_eq!(tick["remaining"], remaining - 1);
        timer.pause().await;
    }

    #[tokio::test]
    async fn test_pause_when_idle() {
        let (_timer, dispatcher, _registry, _frames) = setup();
        let result = call(&dispatcher, 1, "pause", Value::Null).await;
        assert_eq!(result, json!({"success": false, "error": "Timer not running"}));
    }

    #[tokio::test]
    async fn test_reset_restores_duration() {
        let (_timer, dispatcher, _registry, mut frames) = setup();

        call(&dispatcher, 1, "start", json!({"duration": 30})).await;
        frames.next_notification().await;

        let result = call(&dispatcher, 2, "reset", Value::Null).await;
        assert_eq!(result, json!({"success": true, "remaining": 30}));

        // The reset event is the last frame
        let mut last = None;
        while let Some(frame) = frames.next_within(PERIOD * 3).await {
            last = Some(frame);
        }
        let crate::protocol::Message::Notification(reset) = last.unwrap() else {
            panic!("expected reset notification");
        };
        assert_eq!(reset.params, Some(json!({"type": "reset", "remaining": 30})));

        let status = call(&dispatcher, 3, "getStatus", Value::Null).await;
        assert_eq!(
            status,
            json!({"isRunning": false, "remaining": 30, "duration": 30, "startTime": null})
        );
    }

    #[tokio::test]
    async fn test_status_while_running() {
        let (timer, dispatcher, _registry, _frames) = setup();
        call(&dispatcher, 1, "start", Value::Null).await;

        let status = call(&dispatcher, 2, "getStatus", Value::Null).await;
        assert_eq!(status["isRunning"], true);
        assert_eq!(status["duration"], 60);
        assert!(status["startTime"].is_string());
        timer.pause().await;
    }

    #[tokio::test]
    async fn test_invalid_duration_is_invalid_params() {
        let (_timer, dispatcher, _registry, _frames) = setup();
        let response = dispatcher
            .dispatch(
                JsonRpcRequest::new("start")
                    .with_id(1)
                    .with_params(json!({"duration": "soon"}))
                    .into(),
            )
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32602);
    }
}
