//! One-to-many feed of log lines for watching the relay from a browser.

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::trace;

use crate::websocket::RelayState;

#[derive(Clone)]
pub struct DebugFeed {
    tx: broadcast::Sender<String>,
}

impl DebugFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a line. Lines with no subscriber are dropped.
    pub fn publish(&self, line: impl Into<String>) {
        let line = line.into();
        trace!(subscribers = self.tx.receiver_count(), %line, "debug feed");
        let _ = self.tx.send(line);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// `POST /log`: echo the request onto the feed.
pub async fn post_log(State(state): State<RelayState>, method: Method, body: Bytes) -> StatusCode {
    let body = String::from_utf8_lossy(&body);
    state.feed.publish(format!("{method} {}", body.trim_end()));
    StatusCode::NO_CONTENT
}

/// `GET /sse`: every feed line as a `message` event. A subscriber that falls
/// behind skips the lines it missed.
pub async fn stream_feed(
    State(state): State<RelayState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.feed.subscribe())
        .filter_map(|line| line.ok())
        .map(|line| Ok(Event::default().data(line)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn every_subscriber_sees_every_line() {
        let feed = DebugFeed::new(8);
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();
        feed.publish("session opened room-id:alice");
        assert_eq!(a.recv().await.unwrap(), "session opened room-id:alice");
        assert_eq!(b.recv().await.unwrap(), "session opened room-id:alice");
    }

    #[test_timeout::tokio_timeout_test]
    async fn lagging_subscriber_skips_instead_of_blocking() {
        let feed = DebugFeed::new(2);
        let rx = feed.subscribe();
        for n in 0..5 {
            feed.publish(format!("line {n}"));
        }
        let lines: Vec<String> = BroadcastStream::new(rx)
            .filter_map(|line| line.ok())
            .take(2)
            .collect()
            .await;
        assert_eq!(lines, vec!["line 3".to_string(), "line 4".to_string()]);
    }

    #[test_timeout::timeout]
    fn publish_without_subscribers_is_fine() {
        let feed = DebugFeed::new(4);
        feed.publish("nobody listening");
        assert_eq!(feed.subscribers(), 0);
    }
}
