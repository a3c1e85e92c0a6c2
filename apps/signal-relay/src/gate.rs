use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TransportError;
use crate::signaling::ServerMessage;

/// Outbound half of a client connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self);
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = SinkExt::close(self).await;
    }
}

/// Serializes every write to one session's connection.
///
/// The inbound read loop and the engine's callbacks both write through here;
/// the lock is held for the whole frame so writes never interleave. A failed
/// or timed out write drops the sink, so every later write fails fast with
/// [`TransportError::Closed`].
pub struct WriteGate {
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    write_timeout: Duration,
}

impl WriteGate {
    pub fn new(sink: impl FrameSink + 'static, write_timeout: Duration) -> Self {
        Self {
            sink: Mutex::new(Some(Box::new(sink))),
            write_timeout,
        }
    }

    pub async fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        let text = message.encode()?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        let result = match tokio::time::timeout(self.write_timeout, sink.send_text(text)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Write(format!(
                "write exceeded {}ms",
                self.write_timeout.as_millis()
            ))),
        };
        if let Err(err) = &result {
            debug!(error = %err, kind = message.kind(), "dropping sink after failed write");
            guard.take();
        }
        result
    }

    /// Close the connection. Later sends fail with [`TransportError::Closed`].
    pub async fn close(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            sink.close().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.sink.lock().await.is_none()
    }
}
