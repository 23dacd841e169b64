//! External process supervision.

use crate::error::{SupervisorError, SupervisorResult};
use crate::protocol::transport::Notifier;
use crate::protocol::types::LogLevel;
use crate::supervisor::probe::{
    Endpoint, HttpProbe, ProbeOutcome, ProbePolicy, ReadinessProbe, wait_until_ready,
};
use crate::supervisor::state::{StateCell, TaskState};
use crate::supervisor::{StartOutcome, StopOutcome, Supervised, TaskKind};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Budget for the out-of-band shutdown request.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Budget for reaping a child whose output has closed.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// How to launch and probe a service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub endpoint: Endpoint,
    pub probe_policy: ProbePolicy,
    /// Wait between SIGTERM and kill.
    pub term_grace: Duration,
    /// Pause between stop and start on restart.
    pub restart_delay: Duration,
    /// `$event` type announcing the readiness outcome.
    pub ready_event: String,
}

impl ServiceSpec {
    pub fn new(command: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            endpoint,
            probe_policy: ProbePolicy::default(),
            term_grace: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            ready_event: "ready".into(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Snapshot reported by `getServerStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub state: TaskState,
    pub url: String,
    pub pid: Option<u32>,
    pub adopted: bool,
}

/// One run of the service. `child` is `None` for an adopted endpoint.
struct Job {
    generation: u64,
    child: Option<Child>,
    pid: Option<u32>,
    cancel: CancellationToken,
}

struct Inner {
    name: String,
    spec: ServiceSpec,
    state: StateCell,
    notifier: Notifier,
    probe: Arc<dyn ReadinessProbe>,
    http: reqwest::Client,
    job: Mutex<Option<Job>>,
}

/// Supervises one external service process.
///
/// Output lines of the child are relayed as `log` events (stdout at info,
/// stderr at error). Readiness is announced once through
/// `spec.ready_event`; an exit the supervisor did not ask for moves the task
/// to `failed` and emits a single `exited` event.
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    /// Creates a supervisor probing the endpoint over HTTP.
    pub fn new(
        name: impl Into<String>,
        spec: ServiceSpec,
        notifier: Notifier,
    ) -> SupervisorResult<Self> {
        let probe = Arc::new(HttpProbe::new(spec.probe_policy.attempt_timeout)?);
        Self::with_probe(name, spec, notifier, probe)
    }

    pub fn with_probe(
        name: impl Into<String>,
        spec: ServiceSpec,
        notifier: Notifier,
        probe: Arc<dyn ReadinessProbe>,
    ) -> SupervisorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(SHUTDOWN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SupervisorError::Http(e.to_string()))?;
        let name = name.into();

        Ok(Self {
            inner: Arc::new(Inner {
                state: StateCell::new(name.clone()),
                name,
                spec,
                notifier,
                probe,
                http,
                job: Mutex::new(None),
            }),
        })
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.inner.spec
    }

    pub fn url(&self) -> String {
        self.inner.spec.endpoint.url()
    }

    pub fn state(&self) -> TaskState {
        self.inner.state.state()
    }

    /// Adopts a healthy endpoint or spawns the service.
    ///
    /// A spawned service is reported as [`StartOutcome::Starting`]; its
    /// readiness is announced later by the readiness watcher.
    #[instrument(skip(self), fields(task = %self.inner.name))]
    pub async fn start(&self) -> SupervisorResult<StartOutcome> {
        let inner = &self.inner;
        let generation = match inner.state.begin_start() {
            Ok(generation) => generation,
            Err(current) => {
                debug!(state = %current, "start ignored");
                return Ok(StartOutcome::AlreadyRunning);
            }
        };

        let mut slot = inner.job.lock().await;
        if let Some(stale) = slot.take() {
            inner.reap(stale).await;
        }

        if inner.probe_once().await {
            if !inner
                .state
                .compare_and_set(generation, TaskState::Starting, TaskState::Running)
            {
                debug!("stop requested during adoption, not announcing");
                return Ok(StartOutcome::Superseded);
            }
            *slot = Some(Job {
                generation,
                child: None,
                pid: None,
                cancel: CancellationToken::new(),
            });
            drop(slot);

            info!(url = %inner.spec.endpoint.url(), "adopted running service");
            inner
                .notifier
                .log(
                    LogLevel::Info,
                    format!("{} already running at {}", inner.name, inner.spec.endpoint.url()),
                )
                .await;
            inner.announce_ready(None).await;
            return Ok(StartOutcome::Adopted);
        }

        inner
            .notifier
            .log(LogLevel::Info, format!("Starting {}...", inner.name))
            .await;

        let mut child = match inner.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    command: inner.spec.command.clone(),
                    source,
                };
                error!("{}", err);
                inner.state.fail(generation);
                drop(slot);
                inner.notifier.log(LogLevel::Error, err.to_string()).await;
                inner.announce_ready(Some(err.to_string())).await;
                return Err(err);
            }
        };

        let pid = child.id();
        info!(pid, command = %inner.spec.command, "service spawned");

        let mut relays = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            relays.push(tokio::spawn(relay(
                stdout,
                LogLevel::Info,
                inner.notifier.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.push(tokio::spawn(relay(
                stderr,
                LogLevel::Error,
                inner.notifier.clone(),
            )));
        }

        let cancel = CancellationToken::new();
        *slot = Some(Job {
            generation,
            child: Some(child),
            pid,
            cancel: cancel.clone(),
        });
        drop(slot);

        tokio::spawn(Arc::clone(inner).watch_exit(generation, relays));
        tokio::spawn(Arc::clone(inner).watch_readiness(generation, cancel));

        Ok(StartOutcome::Starting)
    }

    /// Terminates the service and sends the out-of-band shutdown request.
    #[instrument(skip(self), fields(task = %self.inner.name))]
    pub async fn stop(&self) -> SupervisorResult<StopOutcome> {
        let inner = &self.inner;
        let generation = inner.state.begin_stop();
        let job = inner.job.lock().await.take();
        let had_job = job.is_some();

        if let Some(job) = job {
            inner.reap(job).await;
        }
        if generation.is_some() || had_job {
            inner.request_shutdown().await;
        }

        match generation {
            Some(generation) => {
                inner
                    .state
                    .compare_and_set(generation, TaskState::Stopping, TaskState::Stopped);
                inner
                    .notifier
                    .log(LogLevel::Info, format!("{} stopped", inner.name))
                    .await;
                Ok(StopOutcome::Stopped)
            }
            None => Ok(StopOutcome::NotRunning),
        }
    }

    pub async fn restart(&self) -> SupervisorResult<StartOutcome> {
        self.stop().await?;
        tokio::time::sleep(self.inner.spec.restart_delay).await;
        self.start().await
    }

    /// Current status. With `probe`, liveness comes from a fresh readiness
    /// check instead of the recorded state.
    pub async fn status(&self, probe: bool) -> ServiceStatus {
        let inner = &self.inner;
        let state = inner.state.state();
        // Busy while a start or stop holds the slot
        let (pid, adopted) = match inner.job.try_lock() {
            Ok(slot) => slot
                .as_ref()
                .map(|job| (job.pid, job.child.is_none()))
                .unwrap_or((None, false)),
            Err(_) => (None, false),
        };
        let running = if probe {
            inner.probe_once().await
        } else {
            state == TaskState::Running
        };

        ServiceStatus {
            running,
            state,
            url: inner.spec.endpoint.url(),
            pid,
            adopted,
        }
    }
}

impl Inner {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .envs(self.spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }
        command
    }

    async fn probe_once(&self) -> bool {
        matches!(
            tokio::time::timeout(
                self.spec.probe_policy.attempt_timeout,
                self.probe.probe(&self.spec.endpoint)
            )
            .await,
            Ok(true)
        )
    }

    async fn announce_ready(&self, error: Option<String>) {
        let url = self.spec.endpoint.url();
        let fields = match error {
            None => json!({ "success": true, "url": url }),
            Some(error) => json!({ "success": false, "url": url, "error": error }),
        };
        self.notifier.event(&self.spec.ready_event, fields).await;
    }

    /// Cancels the job's watchers and terminates its child, if any.
    async fn reap(&self, job: Job) {
        job.cancel.cancel();
        if let Some(mut child) = job.child {
            terminate(&self.name, &mut child, self.spec.term_grace).await;
        }
    }

    async fn request_shutdown(&self) {
        let url = self.spec.endpoint.shutdown_url();
        match self.http.get(&url).send().await {
            Ok(response) => debug!(%url, status = %response.status(), "shutdown request sent"),
            Err(e) => debug!(%url, "shutdown request failed: {}", e),
        }
    }

    async fn watch_readiness(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let policy = self.spec.probe_policy;
        match wait_until_ready(&*self.probe, &self.spec.endpoint, &policy, &cancel).await {
            ProbeOutcome::Ready => {
                if self
                    .state
                    .compare_and_set(generation, TaskState::Starting, TaskState::Running)
                {
                    info!(task = %self.name, url = %self.spec.endpoint.url(), "service ready");
                    self.announce_ready(None).await;
                }
            }
            ProbeOutcome::TimedOut => {
                if !self
                    .state
                    .compare_and_set(generation, TaskState::Starting, TaskState::Failed)
                {
                    return;
                }
                let err = SupervisorError::ReadinessTimeout(policy.timeout.as_millis() as u64);
                error!(task = %self.name, "{}", err);
                self.announce_ready(Some(err.to_string())).await;

                let job = {
                    let mut slot = self.job.lock().await;
                    match slot.take() {
                        Some(job) if job.generation == generation => Some(job),
                        other => {
                            *slot = other;
                            None
                        }
                    }
                };
                if let Some(job) = job {
                    self.reap(job).await;
                }
            }
            ProbeOutcome::Cancelled => {}
        }
    }

    /// Waits for both output relays to close, then reports the exit unless
    /// the supervisor caused it.
    async fn watch_exit(self: Arc<Self>, generation: u64, relays: Vec<JoinHandle<()>>) {
        for relay in relays {
            let _ = relay.await;
        }

        let status = {
            let mut slot = self.job.lock().await;
            match slot.as_mut() {
                Some(job) if job.generation == generation => {
                    job.cancel.cancel();
                    match job.child.as_mut() {
                        Some(child) => tokio::time::timeout(REAP_TIMEOUT, child.wait())
                            .await
                            .ok()
                            .and_then(|r| r.ok()),
                        None => None,
                    }
                }
                // Stopped or replaced in the meantime
                _ => return,
            }
        };

        if self.state.fail(generation) {
            let description = status
                .map(describe_exit)
                .unwrap_or_else(|| "output closed".to_string());
            warn!(task = %self.name, "service exited unexpectedly: {}", description);
            self.notifier
                .event(
                    "exited",
                    json!({
                        "task": self.name,
                        "code": status.and_then(|s| s.code()),
                        "message": SupervisorError::ChildExited(description).to_string(),
                    }),
                )
                .await;
        }
    }
}

/// Relays each output line as a `log` event at `level`.
async fn relay<R: AsyncRead + Unpin>(stream: R, level: LogLevel, notifier: Notifier) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    notifier.log(level, line).await;
                }
            }
            Err(e) => {
                debug!("output relay closed: {}", e);
                break;
            }
        }
    }
}

/// SIGTERM, wait up to `grace`, then kill.
async fn terminate(name: &str, child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(task = %name, "process already exited: {}", describe_exit(status));
        return;
    }

    if let Err(e) = send_terminate(child) {
        warn!(task = %name, "{}", e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(task = %name, "process exited: {}", describe_exit(status)),
        Ok(Err(e)) => warn!(task = %name, "failed to wait for process: {}", e),
        Err(_) => {
            warn!(task = %name, "process did not exit within {:?}, killing", grace);
            if let Err(e) = child.kill().await {
                warn!(task = %name, "failed to kill process: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> SupervisorResult<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| SupervisorError::Signal {
        pid,
        message: e.to_string(),
    })
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> SupervisorResult<()> {
    child.start_kill().map_err(SupervisorError::from)
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}

#[async_trait]
impl Supervised for ProcessSupervisor {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::ExternalProcess
    }

    fn state(&self) -> TaskState {
        self.inner.state.state()
    }

    async fn stop(&self) -> SupervisorResult<StopOutcome> {
        ProcessSupervisor::stop(self).await
    }
}
