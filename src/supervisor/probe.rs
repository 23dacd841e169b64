//! Readiness probing for external services.

use crate::error::{SupervisorError, SupervisorResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Network location of a supervised service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub shutdown_path: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            health_path: "/".into(),
            shutdown_path: "/shutdown".into(),
        }
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    pub fn with_shutdown_path(mut self, path: impl Into<String>) -> Self {
        self.shutdown_path = path.into();
        self
    }

    /// `host:port`, as accepted by `TcpStream::connect`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.authority())
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.url(), self.health_path)
    }

    pub fn shutdown_url(&self) -> String {
        format!("{}{}", self.url(), self.shutdown_path)
    }
}

/// Timing of readiness polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    /// Delay between attempts.
    pub interval: Duration,
    /// Overall bound on the wait.
    pub timeout: Duration,
    /// Bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

/// A single readiness check.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> bool;
}

/// Ready when the port accepts a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> bool {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint.authority()))
            .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                trace!(endpoint = %endpoint.authority(), "connect failed: {}", e);
                false
            }
            Err(_) => false,
        }
    }
}

/// Ready when the port is open and the health path answers 200.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    tcp: TcpProbe,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(attempt_timeout: Duration) -> SupervisorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .map_err(|e| SupervisorError::Http(e.to_string()))?;
        Ok(Self {
            tcp: TcpProbe::new(attempt_timeout),
            client,
        })
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> bool {
        // Cheap port check first so a closed port fails fast
        if !self.tcp.probe(endpoint).await {
            return false;
        }
        match self.client.get(endpoint.health_url()).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                trace!(url = %endpoint.health_url(), "health check failed: {}", e);
                false
            }
        }
    }
}

/// How a readiness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

/// Polls `probe` until it succeeds, the policy's timeout elapses, or
/// `cancel` fires.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    endpoint: &Endpoint,
    policy: &ProbePolicy,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let ready = tokio::select! {
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
            result = tokio::time::timeout(policy.attempt_timeout, probe.probe(endpoint)) => {
                matches!(result, Ok(true))
            }
        };
        if ready {
            debug!(endpoint = %endpoint.authority(), attempts, "endpoint ready");
            return ProbeOutcome::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(endpoint = %endpoint.authority(), attempts, "readiness timed out");
            return ProbeOutcome::TimedOut;
        }

        let pause = policy.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Succeeds from the `ready_after`-th attempt on.
    struct CountingProbe {
        calls: AtomicU32,
        ready_after: u32,
    }

    #[async_trait]
    impl ReadinessProbe for CountingProbe {
        async fn probe(&self, _endpoint: &Endpoint) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }
    }

    fn policy() -> ProbePolicy {
        ProbePolicy {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
            attempt_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_endpoint_urls() {
        let endpoint = Endpoint::new("127.0.0.1", 20242).with_health_path("/api/info");
        assert_eq!(endpoint.url(), "http://127.0.0.1:20242");
        assert_eq!(endpoint.health_url(), "http://127.0.0.1:20242/api/info");
        assert_eq!(endpoint.shutdown_url(), "http://127.0.0.1:20242/shutdown");
    }

    #[tokio::test]
    async fn test_wait_until_ready_after_retries() {
        let probe = CountingProbe {
            calls: AtomicU32::new(0),
            ready_after: 3,
        };
        let outcome = wait_until_ready(
            &probe,
            &Endpoint::new("localhost", 1),
            &policy(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Ready);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_until_ready_times_out() {
        let probe = CountingProbe {
            calls: AtomicU32::new(0),
            ready_after: u32::MAX,
        };
        let started = Instant::now();
        let outcome = wait_until_ready(
            &probe,
            &Endpoint::new("localhost", 1),
            &policy(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_wait_until_ready_cancelled() {
        let probe = CountingProbe {
            calls: AtomicU32::new(0),
            ready_after: u32::MAX,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome =
            wait_until_ready(&probe, &Endpoint::new("localhost", 1), &policy(), &cancel).await;
        assert_eq!(outcome, ProbeOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new(Duration::from_millis(200));

        assert!(probe.probe(&Endpoint::new("127.0.0.1", port)).await);
        drop(listener);
        assert!(!probe.probe(&Endpoint::new("127.0.0.1", port)).await);
    }

    #[tokio::test]
    async fn test_http_probe_checks_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let reply = if request.starts_with("GET /api/info ") {
                        "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}"
                    } else {
                        "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    };
                    let _ = socket.write_all(reply.as_bytes()).await;
                });
            }
        });

        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let healthy = Endpoint::new("127.0.0.1", port).with_health_path("/api/info");
        assert!(probe.probe(&healthy).await);
        let missing = Endpoint::new("127.0.0.1", port).with_health_path("/nope");
        assert!(!probe.probe(&missing).await);
    }
}
