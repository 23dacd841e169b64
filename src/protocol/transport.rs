//! Line-oriented transport for JSON-RPC messages.

use crate::error::{ProtocolError, Result};
use crate::protocol::codec::encode;
use crate::protocol::types::{JsonRpcNotification, JsonRpcResponse, LogLevel, Message};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::{error, trace, warn};

/// Transport trait for the host loop.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reads the next non-blank frame. `None` at end of input.
    async fn read_frame(&self) -> Result<Option<String>>;

    /// The shared output path of this transport.
    fn sink(&self) -> OutputSink;
}

/// Reads frames from any byte stream and writes through an [`OutputSink`].
pub struct LineTransport<R> {
    reader: Mutex<BufReader<R>>,
    sink: OutputSink,
}

/// Transport bound to the process' standard input and output.
pub type StdioTransport = LineTransport<Stdin>;

impl LineTransport<Stdin> {
    pub fn stdio() -> Self {
        Self {
            reader: Mutex::new(BufReader::new(tokio::io::stdin())),
            sink: OutputSink::stdout(),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> LineTransport<R> {
    pub fn new(reader: R, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            sink: OutputSink::new(writer),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Transport for LineTransport<R> {
    async fn read_frame(&self) -> Result<Option<String>> {
        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => return Ok(None), // EOF
                Ok(_) => {
                    // Invalid UTF-8 is kept lossily so the codec reports it as a bad frame
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if line.trim().is_empty() {
                        continue;
                    }
                    trace!("Received line: {}", line);
                    return Ok(Some(line.to_string()));
                }
                Err(e) => {
                    error!("Error reading from input: {}", e);
                    return Err(ProtocolError::Transport(e.to_string().into()).into());
                }
            }
        }
    }

    fn sink(&self) -> OutputSink {
        self.sink.clone()
    }
}

static STDOUT: Lazy<OutputSink> = Lazy::new(|| OutputSink::new(tokio::io::stdout()));

/// The single output path shared by the host loop and every background worker.
///
/// A frame is written and flushed while the lock is held, so concurrent
/// producers never interleave partial lines.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl OutputSink {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// The process-wide stdout sink. Every call returns a handle to the same
    /// writer.
    pub fn stdout() -> Self {
        STDOUT.clone()
    }

    /// Encodes and writes one frame.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let mut line = encode(message)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        trace!("Sending line: {}", line.trim_end());
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn respond(&self, response: JsonRpcResponse) -> Result<()> {
        self.send(&Message::Response(response)).await
    }

    pub async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        self.send(&Message::Notification(notification)).await
    }
}

/// Fire-and-forget notification handle for background workers.
///
/// Write failures are logged, never propagated: background errors must not
/// cross into the host loop.
#[derive(Clone)]
pub struct Notifier {
    sink: OutputSink,
}

impl Notifier {
    pub fn new(sink: OutputSink) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    pub async fn emit(&self, notification: JsonRpcNotification) {
        let method = notification.method.clone();
        if let Err(e) = self.sink.notify(notification).await {
            warn!("Failed to emit {} notification: {}", method, e);
        }
    }

    pub async fn event(&self, kind: &str, fields: Value) {
        self.emit(JsonRpcNotification::event(kind, fields)).await;
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(JsonRpcNotification::log(level, message)).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.emit(JsonRpcNotification::error(message)).await;
    }
}
