//! Peer capability consumed from the media engine.
//!
//! The relay never negotiates media itself. It asks a [`PeerFactory`] for a
//! per-client [`Peer`] handle bound to a room and receives the engine's own
//! negotiation output through a [`PeerEvents`] sink registered at join time.
//! Engines call the sink from their own tasks, concurrently with the session's
//! read loop.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PeerError;
use crate::signaling::{IceCandidate, SessionDescription, Target};

#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Join `peer_id` to `room`, delivering engine events to `events`.
    async fn join(
        &self,
        room: &str,
        peer_id: &str,
        events: Arc<dyn PeerEvents>,
    ) -> Result<Arc<dyn Peer>, PeerError>;
}

#[async_trait]
pub trait Peer: Send + Sync {
    /// Apply a remote offer on the publish leg and produce the answer.
    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError>;

    /// Apply the client's answer to a server offer on the subscribe leg.
    async fn set_remote_description(&self, answer: SessionDescription) -> Result<(), PeerError>;

    /// Add a remote candidate to one leg. Re-adding a known candidate is not
    /// an error.
    async fn add_trickle_candidate(
        &self,
        candidate: IceCandidate,
        target: Target,
    ) -> Result<(), PeerError>;

    /// Leave the room and release engine resources.
    async fn close(&self);
}

#[async_trait]
pub trait PeerEvents: Send + Sync {
    async fn on_local_offer_ready(&self, offer: SessionDescription);
    async fn on_local_candidate_ready(&self, candidate: IceCandidate, target: Target);
}
