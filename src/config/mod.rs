//! Configuration types and builders.

use crate::error::{BridgeError, ConfigError, Result};
use crate::supervisor::{Endpoint, ProbePolicy, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Reads an environment override, failing on an unparsable value.
fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            BridgeError::Config(ConfigError::InvalidValue {
                field: key.into(),
                message: format!("cannot parse '{}'", raw).into(),
            })
        }),
        Err(_) => Ok(None),
    }
}

fn require_nonzero(field: &'static str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.into(),
            message: "must be greater than 0".into(),
        }
        .into());
    }
    Ok(())
}

/// Host loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: Cow<'static, str>,
    pub version: Cow<'static, str>,
    /// Exit code after a SIGINT/SIGTERM.
    pub interrupt_exit_code: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").into(),
            version: "1.0.0".into(),
            interrupt_exit_code: 0,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for ServerConfig.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<Cow<'static, str>>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn interrupt_exit_code(mut self, code: u8) -> Self {
        self.config.interrupt_exit_code = code;
        self
    }

    /// Applies `BOOLTOX_INTERRUPT_EXIT_CODE`.
    pub fn from_env(mut self) -> Result<Self> {
        if let Some(code) = env_parse("BOOLTOX_INTERRUPT_EXIT_CODE")? {
            self.config.interrupt_exit_code = code;
        }
        Ok(self)
    }

    pub fn build(self) -> Result<ServerConfig> {
        if self.config.name.is_empty() {
            return Err(ConfigError::MissingField("name".into()).into());
        }
        if self.config.version.is_empty() {
            return Err(ConfigError::MissingField("version".into()).into());
        }
        Ok(self.config)
    }
}

/// Countdown timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Default countdown length in seconds.
    pub duration: u64,
    /// Length of one countdown step.
    pub period: Duration,
    pub stop_grace: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            duration: 25 * 60,
            period: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl TimerConfig {
    pub fn builder() -> TimerConfigBuilder {
        TimerConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct TimerConfigBuilder {
    config: TimerConfig,
}

impl TimerConfigBuilder {
    pub fn duration(mut self, seconds: u64) -> Self {
        self.config.duration = seconds;
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.config.period = period;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Applies `POMODORO_DURATION_SECS` and `POMODORO_TICK_MS`.
    pub fn from_env(mut self) -> Result<Self> {
        if let Some(duration) = env_parse("POMODORO_DURATION_SECS")? {
            self.config.duration = duration;
        }
        if let Some(ms) = env_parse("POMODORO_TICK_MS")? {
            self.config.period = Duration::from_millis(ms);
        }
        Ok(self)
    }

    pub fn build(self) -> Result<TimerConfig> {
        if self.config.duration == 0 {
            return Err(ConfigError::InvalidValue {
                field: "duration".into(),
                message: "Duration must be greater than 0".into(),
            }
            .into());
        }
        require_nonzero("period", self.config.period)?;
        Ok(self.config)
    }
}

/// Telemetry sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub period: Duration,
    pub stop_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl MonitorConfig {
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct MonitorConfigBuilder {
    config: MonitorConfig,
}

impl MonitorConfigBuilder {
    pub fn period(mut self, period: Duration) -> Self {
        self.config.period = period;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Applies `SYSMON_PERIOD_MS`.
    pub fn from_env(mut self) -> Result<Self> {
        if let Some(ms) = env_parse("SYSMON_PERIOD_MS")? {
            self.config.period = Duration::from_millis(ms);
        }
        Ok(self)
    }

    pub fn build(self) -> Result<MonitorConfig> {
        require_nonzero("period", self.config.period)?;
        Ok(self.config)
    }
}

/// External inspection service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub shutdown_path: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub readiness_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_attempt_timeout: Duration,
    pub term_grace: Duration,
    pub restart_delay: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 20242,
            health_path: "/api/info".into(),
            shutdown_path: "/shutdown".into(),
            command: "python3".into(),
            args: [
                "-m",
                "uiautodev",
                "server",
                "--host",
                "127.0.0.1",
                "--port",
                "20242",
                "--offline",
                "--no-browser",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            working_dir: None,
            env: vec![("PYTHONUNBUFFERED".into(), "1".into())],
            readiness_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_millis(500),
            probe_attempt_timeout: Duration::from_secs(2),
            term_grace: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
        }
    }
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
            .with_health_path(self.health_path.clone())
            .with_shutdown_path(self.shutdown_path.clone())
    }

    pub fn probe_policy(&self) -> ProbePolicy {
        ProbePolicy {
            interval: self.probe_interval,
            timeout: self.readiness_timeout,
            attempt_timeout: self.probe_attempt_timeout,
        }
    }

    /// Launch description for the process supervisor.
    pub fn service_spec(&self, ready_event: &str) -> ServiceSpec {
        let mut spec = ServiceSpec::new(self.command.clone(), self.endpoint())
            .args(self.args.iter().cloned());
        spec.working_dir = self.working_dir.clone();
        spec.env = self.env.clone();
        spec.probe_policy = self.probe_policy();
        spec.term_grace = self.term_grace;
        spec.restart_delay = self.restart_delay;
        spec.ready_event = ready_event.into();
        spec
    }
}

/// Replaces the value following `flag`, if the flag is present.
fn set_flag_value(args: &mut [String], flag: &str, value: &str) {
    if let Some(i) = args.iter().position(|a| a == flag)
        && let Some(slot) = args.get_mut(i + 1)
    {
        *slot = value.to_string();
    }
}

#[derive(Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.set_host(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.set_port(port);
        self
    }

    /// Sets the host and keeps a `--host` argument in step with it.
    fn set_host(&mut self, host: String) {
        set_flag_value(&mut self.config.args, "--host", &host);
        self.config.host = host;
    }

    /// Sets the port and keeps a `--port` argument in step with it.
    fn set_port(&mut self, port: u16) {
        self.config.port = port;
        set_flag_value(&mut self.config.args, "--port", &port.to_string());
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.config.command = command.into();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.config.readiness_timeout = timeout;
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    pub fn term_grace(mut self, grace: Duration) -> Self {
        self.config.term_grace = grace;
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.config.restart_delay = delay;
        self
    }

    /// Build from environment variables.
    ///
    /// `UIAUTODEV_COMMAND` is split on whitespace into command and arguments.
    pub fn from_env(mut self) -> Result<Self> {
        if let Ok(command) = env::var("UIAUTODEV_COMMAND") {
            let mut parts = command.split_whitespace().map(String::from);
            let program = parts.next().ok_or_else(|| ConfigError::InvalidValue {
                field: "UIAUTODEV_COMMAND".into(),
                message: "command is empty".into(),
            })?;
            self.config.command = program;
            self.config.args = parts.collect();
        }

        if let Ok(host) = env::var("UIAUTODEV_HOST") {
            self.set_host(host);
        }

        if let Some(port) = env_parse("UIAUTODEV_PORT")? {
            self.set_port(port);
        }

        if let Ok(dir) = env::var("UIAUTODEV_WORKDIR") {
            self.config.working_dir = Some(dir.into());
        }

        if let Some(secs) = env_parse("UIAUTODEV_READY_TIMEOUT_SECS")? {
            self.config.readiness_timeout = Duration::from_secs(secs);
        }

        Ok(self)
    }

    pub fn build(self) -> Result<ServiceConfig> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<()> {
        if self.config.host.is_empty() {
            return Err(ConfigError::MissingField("host".into()).into());
        }
        if self.config.command.is_empty() {
            return Err(ConfigError::MissingField("command".into()).into());
        }
        if self.config.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".into(),
                message: "Port must be greater than 0".into(),
            }
            .into());
        }
        for path in [&self.config.health_path, &self.config.shutdown_path] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    field: "path".into(),
                    message: format!("'{}' must start with '/'", path).into(),
                }
                .into());
            }
        }
        require_nonzero("readiness_timeout", self.config.readiness_timeout)?;
        require_nonzero("probe_interval", self.config.probe_interval)?;
        require_nonzero("probe_attempt_timeout", self.config.probe_attempt_timeout)?;
        Ok(())
    }
}
