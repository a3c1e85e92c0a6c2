//! In-process stand-ins for the media engine, the store and the socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{PeerError, StoreError, TransportError};
use crate::gate::FrameSink;
use crate::peer::{Peer, PeerEvents, PeerFactory};
use crate::signaling::{IceCandidate, SessionDescription, Target, TrickledCandidate};
use crate::storage::{InMemoryStore, NegotiationRecord, NegotiationStore};

/// Sink that hands every frame to a channel.
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<String>,
}

impl RecordingSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {}
}

/// Sink whose writes never complete.
pub struct StallingSink;

#[async_trait]
impl FrameSink for StallingSink {
    async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn close(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    CreateAnswer(String),
    SetRemoteDescription(String),
    AddCandidate(IceCandidate, Target),
}

/// Scripted peer handle that records every call.
#[derive(Default)]
pub struct MockPeer {
    calls: Mutex<Vec<PeerCall>>,
    events: Mutex<Option<Arc<dyn PeerEvents>>>,
    closes: AtomicUsize,
    reject_offers: AtomicBool,
    reject_answers: AtomicBool,
    reject_candidates: AtomicBool,
}

impl MockPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn candidates(&self) -> Vec<(IceCandidate, Target)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PeerCall::AddCandidate(c, t) => Some((c, t)),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reject_offers(&self, reject: bool) {
        self.reject_offers.store(reject, Ordering::SeqCst);
    }

    pub fn reject_answers(&self, reject: bool) {
        self.reject_answers.store(reject, Ordering::SeqCst);
    }

    pub fn reject_candidates(&self, reject: bool) {
        self.reject_candidates.store(reject, Ordering::SeqCst);
    }

    fn record(&self, call: PeerCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn events(&self) -> Option<Arc<dyn PeerEvents>> {
        self.events.lock().ok().and_then(|e| e.clone())
    }

    /// Fire the engine's offer callback as the engine would.
    pub async fn emit_offer(&self, sdp: &str) {
        if let Some(events) = self.events() {
            events
                .on_local_offer_ready(SessionDescription::offer(sdp))
                .await;
        }
    }

    /// Fire the engine's candidate callback as the engine would.
    pub async fn emit_candidate(&self, candidate: IceCandidate, target: Target) {
        if let Some(events) = self.events() {
            events.on_local_candidate_ready(candidate, target).await;
        }
    }

    /// The answer this peer produces for `offer`.
    pub fn answer_for(offer: &str) -> String {
        format!("v=0\r\na=answer-to:{}", offer.len())
    }
}

#[async_trait]
impl Peer for MockPeer {
    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateAnswer(offer.sdp.clone()));
        if self.reject_offers.load(Ordering::SeqCst) {
            return Err(PeerError::Negotiation("offer rejected".into()));
        }
        Ok(SessionDescription::answer(Self::answer_for(&offer.sdp)))
    }

    async fn set_remote_description(&self, answer: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetRemoteDescription(answer.sdp));
        if self.reject_answers.load(Ordering::SeqCst) {
            return Err(PeerError::Negotiation("answer rejected".into()));
        }
        Ok(())
    }

    async fn add_trickle_candidate(
        &self,
        candidate: IceCandidate,
        target: Target,
    ) -> Result<(), PeerError> {
        self.record(PeerCall::AddCandidate(candidate, target));
        if self.reject_candidates.load(Ordering::SeqCst) {
            return Err(PeerError::Candidate("no remote description".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory handing out [`MockPeer`]s and remembering each one.
#[derive(Default)]
pub struct MockPeerFactory {
    joined: Mutex<Vec<(String, String, Arc<MockPeer>)>>,
    offer_on_join: Mutex<Option<String>>,
    offer_inside_join: Mutex<Option<String>>,
    fail_join: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Have every joined peer emit `sdp` as its initial offer.
    pub fn offer_on_join(&self, sdp: impl Into<String>) {
        if let Ok(mut offer) = self.offer_on_join.lock() {
            *offer = Some(sdp.into());
        }
    }

    /// Have every joined peer deliver `sdp` before `join` even returns.
    pub fn offer_inside_join(&self, sdp: impl Into<String>) {
        if let Ok(mut offer) = self.offer_inside_join.lock() {
            *offer = Some(sdp.into());
        }
    }

    pub fn fail_join(&self, fail: bool) {
        self.fail_join.store(fail, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<(String, String, Arc<MockPeer>)> {
        self.joined.lock().map(|j| j.clone()).unwrap_or_default()
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.peers().last().map(|(_, _, peer)| peer.clone())
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn join(
        &self,
        room: &str,
        peer_id: &str,
        events: Arc<dyn PeerEvents>,
    ) -> Result<Arc<dyn Peer>, PeerError> {
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(PeerError::Join("engine refused join".into()));
        }
        let peer = MockPeer::new();
        if let Ok(mut slot) = peer.events.lock() {
            *slot = Some(events.clone());
        }
        if let Ok(mut joined) = self.joined.lock() {
            joined.push((room.to_string(), peer_id.to_string(), peer.clone()));
        }
        let inline = self.offer_inside_join.lock().ok().and_then(|o| o.clone());
        if let Some(sdp) = inline {
            events
                .on_local_offer_ready(SessionDescription::offer(sdp))
                .await;
        }
        let offer = self.offer_on_join.lock().ok().and_then(|o| o.clone());
        if let Some(sdp) = offer {
            tokio::spawn(async move {
                events
                    .on_local_offer_ready(SessionDescription::offer(sdp))
                    .await;
            });
        }
        Ok(peer)
    }
}

/// Store that is never reachable.
pub struct FailingStore;

#[async_trait]
impl NegotiationStore for FailingStore {
    fn backend(&self) -> &'static str {
        "failing"
    }

    async fn store(&self, _record: &NegotiationRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn fetch(&self, _key: &str) -> Result<Option<NegotiationRecord>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn append_candidate(
        &self,
        _key: &str,
        _entry: &TrickledCandidate,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set_description(
        &self,
        _key: &str,
        _description: &SessionDescription,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Store whose calls never complete.
pub struct StallingStore;

#[async_trait]
impl NegotiationStore for StallingStore {
    fn backend(&self) -> &'static str {
        "stalling"
    }

    async fn store(&self, _record: &NegotiationRecord) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn fetch(&self, _key: &str) -> Result<Option<NegotiationRecord>, StoreError> {
        std::future::pending().await
    }

    async fn append_candidate(
        &self,
        _key: &str,
        _entry: &TrickledCandidate,
    ) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn set_description(
        &self,
        _key: &str,
        _description: &SessionDescription,
    ) -> Result<(), StoreError> {
        std::future::pending().await
    }
}

/// In-memory store whose record writes take `delay` to land.
pub struct SlowStore {
    inner: Arc<InMemoryStore>,
    delay: Duration,
}

impl SlowStore {
    pub fn new(inner: Arc<InMemoryStore>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { inner, delay })
    }
}

#[async_trait]
impl NegotiationStore for SlowStore {
    fn backend(&self) -> &'static str {
        "slow"
    }

    async fn store(&self, record: &NegotiationRecord) -> Result<(), StoreError> {
        self.inner.store(record).await
    }

    async fn fetch(&self, key: &str) -> Result<Option<NegotiationRecord>, StoreError> {
        self.inner.fetch(key).await
    }

    async fn append_candidate(
        &self,
        key: &str,
        entry: &TrickledCandidate,
    ) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.append_candidate(key, entry).await
    }

    async fn set_description(
        &self,
        key: &str,
        description: &SessionDescription,
    ) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_description(key, description).await
    }
}
