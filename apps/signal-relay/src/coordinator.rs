//! Reactive signaling dispatcher.
//!
//! Inbound client messages and the engine's own callbacks both end up here.
//! Every outbound frame goes through the session's write gate; every store
//! call is best effort and only ever logged on failure.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{PeerError, SignalError, StoreError, TransportError};
use crate::gate::WriteGate;
use crate::metrics;
use crate::peer::{PeerEvents, PeerFactory};
use crate::session::{Session, SessionKey};
use crate::signaling::{
    ClientMessage, Envelope, IceCandidate, ServerMessage, SessionDescription, Target,
    TrickledCandidate,
};
use crate::storage::{NegotiationRecord, Persistence};

pub struct Signaling {
    factory: Arc<dyn PeerFactory>,
    persistence: Persistence,
}

impl Signaling {
    pub fn new(factory: Arc<dyn PeerFactory>, persistence: Persistence) -> Self {
        Self {
            factory,
            persistence,
        }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Build the session for a new connection.
    ///
    /// Recovers the stored record, resets its candidate list, joins the
    /// engine and replays the recovered candidates in arrival order before
    /// the caller starts reading live traffic. Only a failed join is an error;
    /// the session is torn down in that case.
    pub async fn open(&self, key: SessionKey, gate: WriteGate) -> Result<Arc<Session>, SignalError> {
        let session = Session::new(key, gate);
        let store_key = session.store_key().to_string();

        let recovered = match self.persistence.recover(&store_key).await {
            Ok(record) => record,
            Err(err) => {
                store_failed("recover", &store_key, &err);
                None
            }
        };
        let fresh = recovered
            .as_ref()
            .map(NegotiationRecord::restarted)
            .unwrap_or_else(|| NegotiationRecord::new(store_key.clone()));
        if let Err(err) = self.persistence.store(&fresh).await {
            store_failed("store", &store_key, &err);
        }

        let events = Arc::new(SessionEvents::new(&session, self.persistence.clone()));
        let peer = match self
            .factory
            .join(session.key().room(), session.key().peer(), events)
            .await
        {
            Ok(peer) => peer,
            Err(err) => {
                session.teardown().await;
                return Err(err.into());
            }
        };
        // A callback fired during join may already have torn the session
        // down; the handle is then refused and must be closed here.
        if let Err(extra) = session.attach_peer(peer) {
            extra.close().await;
        }
        if session.is_closed() {
            return Err(TransportError::Closed.into());
        }

        if let Some(record) = recovered {
            self.replay(&session, record).await;
        }
        Ok(session)
    }

    async fn replay(&self, session: &Session, record: NegotiationRecord) {
        let Some(peer) = session.peer() else {
            return;
        };
        let total = record.ice_candidates.len();
        for entry in record.ice_candidates {
            if let Err(err) = peer.add_trickle_candidate(entry.candidate, entry.target).await {
                debug!(session = %session.key(), error = %err, "replayed candidate not applied");
            }
        }
        if total > 0 {
            info!(session = %session.key(), candidates = total, "replayed recovered candidates");
        }
    }

    /// Decode and handle one inbound envelope.
    ///
    /// Returns an error only when the session must end; protocol, negotiation
    /// and persistence problems are logged here and swallowed.
    pub async fn dispatch(&self, session: &Session, envelope: Envelope) -> Result<(), SignalError> {
        let kind = envelope.kind.clone();
        let result = match ClientMessage::from_envelope(envelope) {
            Ok(Some(message)) => self.handle(session, message).await,
            Ok(None) => {
                debug!(session = %session.key(), kind = %kind, "ignoring unknown message kind");
                Ok(())
            }
            Err(err) => Err(err),
        };
        match result {
            Err(err) if err.is_fatal() => Err(err),
            Err(SignalError::Protocol(reason)) => {
                debug!(session = %session.key(), kind = %kind, %reason, "dropping malformed message");
                Ok(())
            }
            Err(err) => {
                warn!(session = %session.key(), kind = %kind, error = %err, "signaling message failed");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Drive the peer for one inbound message.
    pub async fn handle(&self, session: &Session, message: ClientMessage) -> Result<(), SignalError> {
        metrics::MESSAGES
            .with_label_values(&[message.kind()])
            .inc();
        let peer = session.peer().ok_or(PeerError::Closed)?;

        match message {
            ClientMessage::Offer(offer) => {
                let answer = peer.create_answer(offer).await?;
                persist_description(&self.persistence, session, &answer).await;
                send(session, ServerMessage::Description(answer)).await?;
            }
            ClientMessage::Answer(answer) => {
                peer.set_remote_description(answer).await?;
            }
            ClientMessage::Trickle { candidate, target } => {
                // Persist even when the peer refuses it for now; clients
                // trickle before the remote description exists.
                let applied = peer
                    .add_trickle_candidate(candidate.clone(), target)
                    .await;
                self.append(session, &TrickledCandidate { candidate, target })
                    .await;
                applied?;
            }
        }
        Ok(())
    }

    async fn append(&self, session: &Session, entry: &TrickledCandidate) {
        let written = session
            .write_record(self.persistence.append_candidate(session.store_key(), entry))
            .await;
        if let Some(Err(err)) = written {
            store_failed("append_candidate", session.store_key(), &err);
        }
    }
}

async fn persist_description(persistence: &Persistence, session: &Session, description: &SessionDescription) {
    let written = session
        .write_record(persistence.set_description(session.store_key(), description))
        .await;
    if let Some(Err(err)) = written {
        store_failed("set_description", session.store_key(), &err);
    }
}

async fn send(session: &Session, message: ServerMessage) -> Result<(), TransportError> {
    session.send(&message).await?;
    metrics::OUTBOUND.with_label_values(&[message.kind()]).inc();
    Ok(())
}

fn store_failed(op: &'static str, key: &str, err: &StoreError) {
    metrics::STORE_FAILURES.with_label_values(&[op]).inc();
    warn!(session = %key, op, error = %err, "negotiation store call failed; continuing without it");
}

/// Engine callbacks for one session.
///
/// Holds the session weakly: the engine may outlive it by a few callbacks,
/// which are then dropped.
pub struct SessionEvents {
    session: Weak<Session>,
    persistence: Persistence,
}

impl SessionEvents {
    pub fn new(session: &Arc<Session>, persistence: Persistence) -> Self {
        Self {
            session: Arc::downgrade(session),
            persistence,
        }
    }

    fn live_session(&self) -> Option<Arc<Session>> {
        self.session.upgrade().filter(|session| !session.is_closed())
    }

    async fn deliver(&self, session: &Session, message: ServerMessage) {
        if let Err(err) = send(session, message).await {
            // The read loop notices the teardown and unregisters the session.
            warn!(session = %session.key(), error = %err, "write from engine callback failed; closing session");
            session.teardown().await;
        }
    }
}

#[async_trait]
impl PeerEvents for SessionEvents {
    async fn on_local_offer_ready(&self, offer: SessionDescription) {
        let Some(session) = self.live_session() else {
            return;
        };
        persist_description(&self.persistence, &session, &offer).await;
        self.deliver(&session, ServerMessage::Description(offer))
            .await;
    }

    async fn on_local_candidate_ready(&self, candidate: IceCandidate, target: Target) {
        let Some(session) = self.live_session() else {
            return;
        };
        self.deliver(&session, ServerMessage::Candidate { candidate, target })
            .await;
    }
}
