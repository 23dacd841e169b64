//! Shared helpers for unit tests.

use crate::protocol::codec::decode;
use crate::protocol::transport::OutputSink;
use crate::protocol::types::{JsonRpcNotification, JsonRpcResponse, Message};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Decoded frames written to a capturing [`OutputSink`].
pub(crate) struct Frames {
    lines: Lines<BufReader<DuplexStream>>,
}

impl Frames {
    pub(crate) fn new(reader: DuplexStream) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Waits for the next frame, panicking after a generous timeout.
    pub(crate) async fn next(&mut self) -> Message {
        self.next_within(FRAME_TIMEOUT)
            .await
            .expect("expected another frame")
    }

    /// Returns the next frame, or `None` on timeout or end of output.
    pub(crate) async fn next_within(&mut self, wait: Duration) -> Option<Message> {
        match tokio::time::timeout(wait, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => Some(decode(&line).expect("backend wrote an invalid frame")),
            _ => None,
        }
    }

    pub(crate) async fn next_notification(&mut self) -> JsonRpcNotification {
        match self.next().await {
            Message::Notification(n) => n,
            other => panic!("expected notification, got {other:?}"),
        }
    }

    pub(crate) async fn next_response(&mut self) -> JsonRpcResponse {
        match self.next().await {
            Message::Response(r) => r,
            other => panic!("expected response, got {other:?}"),
        }
    }
}

/// An output sink whose frames can be read back by the test.
pub(crate) fn capture() -> (OutputSink, Frames) {
    let (writer, reader) = tokio::io::duplex(1 << 20);
    (OutputSink::new(writer), Frames::new(reader))
}
