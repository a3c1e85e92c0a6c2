use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::error::TransportError;
use crate::gate::WriteGate;
use crate::peer::Peer;
use crate::signaling::ServerMessage;

/// Generate a connection-scoped peer id
pub fn generate_peer_id() -> String {
    Uuid::new_v4().to_string()
}

/// Room plus peer identity. Used both as registry key and persistence key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    room: String,
    peer: String,
}

impl SessionKey {
    pub fn new(room: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            peer: peer.into(),
        }
    }

    /// Key from optional selectors. A missing room means `default_room`; a
    /// missing peer gets a fresh id, so the key is unique to the connection.
    pub fn from_selectors(room: Option<&str>, peer: Option<&str>, default_room: &str) -> Self {
        let room = room
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(default_room);
        let peer = match peer.map(str::trim).filter(|p| !p.is_empty()) {
            Some(peer) => peer.to_string(),
            None => generate_peer_id(),
        };
        Self::new(room, peer)
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room, self.peer)
    }
}

/// One client connection: its write gate and the peer handle joined for it.
pub struct Session {
    key: SessionKey,
    store_key: String,
    connection_id: Uuid,
    opened_at: DateTime<Utc>,
    gate: WriteGate,
    peer: Mutex<PeerSlot>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    record_writes: AsyncMutex<()>,
}

/// The bound peer handle, and whether teardown has already claimed it.
#[derive(Default)]
struct PeerSlot {
    peer: Option<Arc<dyn Peer>>,
    released: bool,
}

impl Session {
    pub fn new(key: SessionKey, gate: WriteGate) -> Arc<Self> {
        Arc::new(Self {
            store_key: key.to_string(),
            key,
            connection_id: Uuid::new_v4(),
            opened_at: Utc::now(),
            gate,
            peer: Mutex::new(PeerSlot::default()),
            closed: AtomicBool::new(false),
            closed_tx: watch::channel(false).0,
            record_writes: AsyncMutex::new(()),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// `room:peer`, the id of this session's negotiation record.
    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, PeerSlot> {
        self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the engine handle. The handle comes back, unbound, if one is
    /// already bound or the session has been torn down; the caller owns
    /// closing it then.
    pub fn attach_peer(&self, peer: Arc<dyn Peer>) -> Result<(), Arc<dyn Peer>> {
        let mut slot = self.slot();
        if slot.released || slot.peer.is_some() {
            return Err(peer);
        }
        slot.peer = Some(peer);
        Ok(())
    }

    pub fn peer(&self) -> Option<Arc<dyn Peer>> {
        self.slot().peer.clone()
    }

    /// Write one message through the session's gate.
    pub async fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.gate.send(message).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the session has been torn down, whoever did it.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Release the peer handle and close the connection. Only the first call
    /// does anything; it returns `true`.
    pub async fn teardown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed_tx.send_replace(true);
        let peer = {
            let mut slot = self.slot();
            slot.released = true;
            slot.peer.clone()
        };
        if let Some(peer) = peer {
            peer.close().await;
        }
        self.gate.close().await;
        true
    }

    /// Run a write to this session's negotiation record, unless the session
    /// is already torn down. Returns `None` when the write was skipped.
    pub async fn write_record<F: Future>(&self, write: F) -> Option<F::Output> {
        let _guard = self.record_writes.lock().await;
        if self.is_closed() {
            return None;
        }
        Some(write.await)
    }

    /// Wait until no record write of this session is in flight. After a
    /// teardown, no later write can start either.
    pub async fn settled(&self) {
        let _guard = self.record_writes.lock().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
