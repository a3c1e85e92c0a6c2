use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::Signaling;
use crate::debug_feed::DebugFeed;
use crate::gate::WriteGate;
use crate::peer::PeerFactory;
use crate::registry::SessionRegistry;
use crate::session::SessionKey;
use crate::signaling::Envelope;
use crate::storage::{NegotiationStore, Persistence};

/// Process-wide state shared by every connection and HTTP route.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<SessionRegistry>,
    pub signaling: Arc<Signaling>,
    pub feed: DebugFeed,
    pub config: Arc<Config>,
}

impl RelayState {
    pub fn new(
        config: Config,
        factory: Arc<dyn PeerFactory>,
        store: Arc<dyn NegotiationStore>,
    ) -> Self {
        let persistence = Persistence::new(store, config.store_timeout());
        Self {
            registry: Arc::new(SessionRegistry::new()),
            signaling: Arc::new(Signaling::new(factory, persistence)),
            feed: DebugFeed::new(config.debug_feed_capacity),
            config: Arc::new(config),
        }
    }
}

/// Room and peer selectors accepted as query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub room_id: Option<String>,
    pub peer_id: Option<String>,
}

/// `GET /ws?room_id=..&peer_id=..`
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let key = SessionKey::from_selectors(
        params.room_id.as_deref(),
        params.peer_id.as_deref(),
        &state.config.default_room,
    );
    upgrade(ws, state, key)
}

/// `GET /ws/:room`, peer optionally from the query.
pub async fn room_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    Path(room): Path<String>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let key = SessionKey::from_selectors(
        Some(&room),
        params.peer_id.as_deref(),
        &state.config.default_room,
    );
    upgrade(ws, state, key)
}

/// `GET /ws/:room/:peer`
pub async fn peer_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    Path((room, peer)): Path<(String, String)>,
) -> Response {
    let key = SessionKey::from_selectors(Some(&room), Some(&peer), &state.config.default_room);
    upgrade(ws, state, key)
}

fn upgrade(ws: WebSocketUpgrade, state: RelayState, key: SessionKey) -> Response {
    debug!(session = %key, "websocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state, key))
}

/// Run one connection: open its session, then read and dispatch one message
/// at a time until the client leaves, a read or write fails, or a newer
/// connection takes over the key.
async fn handle_socket(socket: WebSocket, state: RelayState, key: SessionKey) {
    let (sink, mut stream) = socket.split();
    let gate = WriteGate::new(sink, state.config.write_timeout());

    let signaling = state.signaling.clone();
    let session = match state
        .registry
        .create(key.clone(), || signaling.open(key.clone(), gate))
        .await
    {
        Ok(session) => session,
        Err(err) => {
            warn!(session = %key, error = %err, "could not open session");
            state.feed.publish(format!("session {key} rejected: {err}"));
            return;
        }
    };
    info!(
        session = %key,
        connection = %session.connection_id(),
        store = state.signaling.persistence().backend(),
        "session opened"
    );
    state.feed.publish(format!("session opened {key}"));

    loop {
        let frame = tokio::select! {
            _ = session.closed() => {
                debug!(session = %key, "session closed elsewhere; leaving read loop");
                break;
            }
            frame = stream.next() => frame,
        };

        let decoded = match frame {
            Some(Ok(Message::Text(text))) => serde_json::from_str::<Envelope>(&text),
            Some(Ok(Message::Binary(bytes))) => serde_json::from_slice::<Envelope>(&bytes),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(session = %key, error = %err, "websocket read failed");
                break;
            }
        };
        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(session = %key, error = %err, "unreadable frame; closing session");
                break;
            }
        };

        if let Err(err) = state.signaling.dispatch(&session, envelope).await {
            warn!(session = %key, error = %err, "connection failed; closing session");
            break;
        }
    }

    let released = state.registry.release(&session).await;
    info!(
        session = %key,
        connection = %session.connection_id(),
        released,
        open_for_secs = (chrono::Utc::now() - session.opened_at()).num_seconds(),
        "session closed"
    );
    state.feed.publish(format!("session closed {key}"));
}
