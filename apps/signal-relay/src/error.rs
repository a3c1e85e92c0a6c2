use thiserror::Error;

/// Failure reported by the media engine's peer handle.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer join failed: {0}")]
    Join(String),
    #[error("negotiation rejected: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("peer closed")]
    Closed,
}

/// Failure of the external negotiation store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store deadline of {0}ms exceeded")]
    Deadline(u64),
    #[error("record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Failure to deliver a frame on a session's connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("write failed: {0}")]
    Write(String),
}

/// Signaling error classes. Only transport failures end a session; the rest
/// are logged and the session keeps running.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("negotiation: {0}")]
    Negotiation(#[from] PeerError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("persistence: {0}")]
    Persistence(#[from] StoreError),
}

impl SignalError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SignalError::Transport(_))
    }
}
