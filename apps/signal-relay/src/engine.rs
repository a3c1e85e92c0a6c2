//! Peer capability backed by webrtc-rs.
//!
//! Each joined client gets two peer connections. The publisher leg answers
//! client offers; the subscriber leg offers to the client and is kicked off by
//! opening the `ion-sfu` data channel at join time. Media forwarding between
//! room members is not done here.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::PeerError;
use crate::peer::{Peer, PeerEvents, PeerFactory};
use crate::signaling::{IceCandidate, SessionDescription, Target};

pub const DATA_CHANNEL_LABEL: &str = "ion-sfu";

/// Remote candidates held per leg while it has no remote description.
const MAX_PENDING_CANDIDATES: usize = 64;

pub struct RtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    rooms: Arc<DashMap<String, HashSet<String>>>,
}

impl RtcEngine {
    pub fn new(ice_urls: &[String]) -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| PeerError::Join(format!("codec registration: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| PeerError::Join(format!("interceptor registration: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_urls.to_vec(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            ice_servers,
            rooms: Arc::new(DashMap::new()),
        })
    }

    /// Members currently joined to `room`.
    pub fn room_members(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    async fn new_connection(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        self.api
            .new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(|e| PeerError::Join(e.to_string()))
    }
}

#[async_trait]
impl PeerFactory for RtcEngine {
    async fn join(
        &self,
        room: &str,
        peer_id: &str,
        events: Arc<dyn PeerEvents>,
    ) -> Result<Arc<dyn Peer>, PeerError> {
        let publisher = Leg::new(self.new_connection().await?, Target::Publish);
        let subscriber = Leg::new(self.new_connection().await?, Target::Subscribe);
        publisher.forward_candidates(events.clone());
        subscriber.forward_candidates(events.clone());
        subscriber.offer_on_negotiation(events);

        let peer = Arc::new(RtcPeer {
            room: room.to_string(),
            id: peer_id.to_string(),
            publisher,
            subscriber,
            rooms: self.rooms.clone(),
        });
        if let Err(err) = peer
            .subscriber
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
        {
            peer.close().await;
            return Err(PeerError::Join(format!("data channel: {err}")));
        }

        let members = {
            let mut members = self.rooms.entry(room.to_string()).or_default();
            members.insert(peer_id.to_string());
            members.len()
        };
        info!(room, peer = peer_id, members, "peer joined room");
        Ok(peer)
    }
}

/// One negotiation leg. Remote candidates that arrive before the remote
/// description are held until it is applied, up to
/// [`MAX_PENDING_CANDIDATES`]; later ones are dropped.
struct Leg {
    target: Target,
    pc: Arc<RTCPeerConnection>,
    pending: Mutex<Vec<RTCIceCandidateInit>>,
}

impl Leg {
    fn new(pc: Arc<RTCPeerConnection>, target: Target) -> Self {
        Self {
            target,
            pc,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn forward_candidates(&self, events: Arc<dyn PeerEvents>) {
        let target = self.target;
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            events
                                .on_local_candidate_ready(from_init(init), target)
                                .await
                        }
                        Err(err) => debug!(error = %err, %target, "unserializable local candidate"),
                    }
                })
            }));
    }

    fn offer_on_negotiation(&self, events: Arc<dyn PeerEvents>) {
        let pc: Weak<RTCPeerConnection> = Arc::downgrade(&self.pc);
        self.pc.on_negotiation_needed(Box::new(move || {
            let pc = pc.clone();
            let events = events.clone();
            Box::pin(async move {
                let Some(pc) = pc.upgrade() else {
                    return;
                };
                match create_offer(&pc).await {
                    Ok(offer) => events.on_local_offer_ready(offer).await,
                    Err(err) => warn!(error = %err, "subscriber offer failed"),
                }
            })
        }));
    }

    async fn set_remote(&self, description: RTCSessionDescription) -> Result<(), PeerError> {
        let mut pending = self.pending.lock().await;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        for candidate in pending.drain(..) {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                debug!(error = %err, target = %self.target, "buffered candidate rejected");
            }
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), PeerError> {
        let mut pending = self.pending.lock().await;
        if self.pc.remote_description().await.is_none() {
            if pending.len() >= MAX_PENDING_CANDIDATES {
                debug!(target = %self.target, "candidate buffer full; dropping early candidate");
            } else {
                pending.push(candidate);
            }
            return Ok(());
        }
        drop(pending);
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }
}

async fn create_offer(pc: &RTCPeerConnection) -> Result<SessionDescription, webrtc::Error> {
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer.clone()).await?;
    Ok(SessionDescription::offer(offer.sdp))
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

pub struct RtcPeer {
    room: String,
    id: String,
    publisher: Leg,
    subscriber: Leg,
    rooms: Arc<DashMap<String, HashSet<String>>>,
}

impl RtcPeer {
    fn leg(&self, target: Target) -> &Leg {
        match target {
            Target::Publish => &self.publisher,
            Target::Subscribe => &self.subscriber,
        }
    }
}

#[async_trait]
impl Peer for RtcPeer {
    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        let offer = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.publisher.set_remote(offer).await?;
        let answer = self
            .publisher
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.publisher
            .pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, answer: SessionDescription) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.subscriber.set_remote(answer).await
    }

    async fn add_trickle_candidate(
        &self,
        candidate: IceCandidate,
        target: Target,
    ) -> Result<(), PeerError> {
        self.leg(target).add_candidate(to_init(candidate)).await
    }

    async fn close(&self) {
        for leg in [&self.publisher, &self.subscriber] {
            if let Err(err) = leg.pc.close().await {
                debug!(peer = %self.id, target = %leg.target, error = %err, "peer connection close");
            }
        }
        let emptied = match self.rooms.get_mut(&self.room) {
            Some(mut members) => {
                members.remove(&self.id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            self.rooms.remove_if(&self.room, |_, members| members.is_empty());
        }
        info!(room = %self.room, peer = %self.id, "peer left room");
    }
}
