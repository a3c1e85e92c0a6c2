pub mod cli;
pub mod config;
pub mod coordinator;
pub mod debug_feed;
pub mod engine;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod metrics;
pub mod mock;
pub mod peer;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::debug_feed::{post_log, stream_feed};
use crate::handlers::{get_session_record, health_check, prometheus_metrics};
use crate::websocket::{
    peer_websocket_handler, room_websocket_handler, websocket_handler, RelayState,
};

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/sessions/:room/:peer", get(get_session_record))
        .route("/log", post(post_log))
        .route("/sse", get(stream_feed))
        .route("/ws", get(websocket_handler))
        .route("/ws/:room", get(room_websocket_handler))
        .route("/ws/:room/:peer", get(peer_websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
