use serde::{Deserialize, Serialize};

use crate::error::SignalError;

/// Kind tag carried by a session description.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An offer or answer document, serialized the way browsers expect
/// (`{"type":"answer","sdp":"..."}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Negotiation leg a candidate belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "i64", into = "u8")]
pub enum Target {
    Publish,
    Subscribe,
}

impl Target {
    pub fn as_u8(self) -> u8 {
        match self {
            Target::Publish => 0,
            Target::Subscribe => 1,
        }
    }
}

impl TryFrom<i64> for Target {
    type Error = SignalError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Target::Publish),
            1 => Ok(Target::Subscribe),
            other => Err(SignalError::Protocol(format!(
                "trickle target {other} out of range"
            ))),
        }
    }
}

impl From<Target> for u8 {
    fn from(target: Target) -> Self {
        target.as_u8()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Publish => f.write_str("publish"),
            Target::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// Envelope every client frame arrives in.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Body of a `trickle` message, itself JSON encoded inside `data`.
#[derive(Debug, Deserialize)]
struct TricklePayload {
    candidates: IceCandidate,
    target: i64,
}

/// Inbound message after kind-specific payload decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Trickle {
        candidate: IceCandidate,
        target: Target,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Offer(_) => "offer",
            ClientMessage::Answer(_) => "answer",
            ClientMessage::Trickle { .. } => "trickle",
        }
    }

    /// Decode the payload of an envelope.
    ///
    /// `Ok(None)` means the kind is unknown and the frame should be ignored.
    /// A known kind with an unusable payload is a [`SignalError::Protocol`].
    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, SignalError> {
        let message = match envelope.kind.as_str() {
            "offer" => ClientMessage::Offer(description(&envelope.data, SdpType::Offer)?),
            "answer" => ClientMessage::Answer(description(&envelope.data, SdpType::Answer)?),
            "trickle" => {
                let raw = envelope.data.as_str().ok_or_else(|| {
                    SignalError::Protocol("trickle data is not a string".into())
                })?;
                let payload: TricklePayload = serde_json::from_str(raw)
                    .map_err(|e| SignalError::Protocol(format!("trickle payload: {e}")))?;
                ClientMessage::Trickle {
                    candidate: payload.candidates,
                    target: Target::try_from(payload.target)?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

// Browsers send the bare SDP text; some clients wrap it in a description
// object, either inline or JSON encoded.
fn description(data: &serde_json::Value, sdp_type: SdpType) -> Result<SessionDescription, SignalError> {
    let sdp = match data {
        serde_json::Value::String(text) => {
            match serde_json::from_str::<SessionDescription>(text) {
                Ok(wrapped) => wrapped.sdp,
                Err(_) => text.clone(),
            }
        }
        serde_json::Value::Object(_) => {
            serde_json::from_value::<SessionDescription>(data.clone())
                .map_err(|e| SignalError::Protocol(format!("session description: {e}")))?
                .sdp
        }
        _ => {
            return Err(SignalError::Protocol(
                "session description payload missing".into(),
            ))
        }
    };
    if sdp.trim().is_empty() {
        return Err(SignalError::Protocol("empty session description".into()));
    }
    Ok(SessionDescription { sdp_type, sdp })
}

/// Messages the relay writes to the client.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Server-originated offer or the answer to a client offer.
    Description(SessionDescription),
    /// Locally gathered candidate for one of the legs.
    Candidate { candidate: IceCandidate, target: Target },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Description(desc) => match desc.sdp_type {
                SdpType::Offer => "offer",
                SdpType::Answer => "answer",
                SdpType::Pranswer => "pranswer",
                SdpType::Rollback => "rollback",
            },
            ServerMessage::Candidate { .. } => "candidate",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Candidate as persisted for replay: the candidate fields plus its leg.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrickledCandidate {
    #[serde(flatten)]
    pub candidate: IceCandidate,
    pub target: Target,
}
