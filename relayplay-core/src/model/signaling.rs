use crate::model::peer::PeerId;
use crate::model::room::RoomId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Bye,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Bye => "bye",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session description produced by the peer-connection primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Identifies one offer/answer exchange. Minted by the offering side and echoed
/// back in every answer and candidate belonging to that exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NegotiationId(pub Uuid);

impl NegotiationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NegotiationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NegotiationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionPayload {
    #[serde(flatten)]
    pub description: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation: Option<NegotiationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    #[serde(flatten)]
    pub candidate: IceCandidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation: Option<NegotiationId>,
}

/// A `bye` names the negotiation it ends, so a redelivered one cannot close
/// a newer connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation: Option<NegotiationId>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("expected a {expected} envelope, got {found}")]
    WrongKind {
        expected: &'static str,
        found: SignalKind,
    },

    #[error("{envelope} envelope carries a {description:?} description")]
    DescriptionMismatch {
        envelope: SignalKind,
        description: SdpKind,
    },

    #[error("invalid envelope payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One signaling message as it travels over the relay.
///
/// Fields are private so an envelope cannot be altered after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    kind: SignalKind,
    room: RoomId,
    from: PeerId,
    to: PeerId,
    payload: serde_json::Value,
    ts: u64,
}

impl SignalingEnvelope {
    pub fn new(
        kind: SignalKind,
        room: RoomId,
        from: PeerId,
        to: PeerId,
        payload: serde_json::Value,
        ts: u64,
    ) -> Self {
        Self {
            kind,
            room,
            from,
            to,
            payload,
            ts,
        }
    }

    fn stamped(
        kind: SignalKind,
        room: RoomId,
        from: PeerId,
        to: PeerId,
        payload: &impl Serialize,
    ) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::new(kind, room, from, to, payload, unix_millis()))
    }

    pub fn offer(
        room: RoomId,
        from: PeerId,
        to: PeerId,
        payload: &DescriptionPayload,
    ) -> Result<Self, EnvelopeError> {
        Self::stamped(SignalKind::Offer, room, from, to, payload)
    }

    pub fn answer(
        room: RoomId,
        from: PeerId,
        to: PeerId,
        payload: &DescriptionPayload,
    ) -> Result<Self, EnvelopeError> {
        Self::stamped(SignalKind::Answer, room, from, to, payload)
    }

    pub fn candidate(
        room: RoomId,
        from: PeerId,
        to: PeerId,
        payload: &CandidatePayload,
    ) -> Result<Self, EnvelopeError> {
        Self::stamped(SignalKind::Candidate, room, from, to, payload)
    }

    pub fn bye(
        room: RoomId,
        from: PeerId,
        to: PeerId,
        payload: &ByePayload,
    ) -> Result<Self, EnvelopeError> {
        Self::stamped(SignalKind::Bye, room, from, to, payload)
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn from(&self) -> &PeerId {
        &self.from
    }

    pub fn to(&self) -> &PeerId {
        &self.to
    }

    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Decodes the payload of an offer or answer envelope.
    pub fn description(&self) -> Result<DescriptionPayload, EnvelopeError> {
        let expected = match self.kind {
            SignalKind::Offer => SdpKind::Offer,
            SignalKind::Answer => SdpKind::Answer,
            found => {
                return Err(EnvelopeError::WrongKind {
                    expected: "offer or answer",
                    found,
                });
            }
        };

        let payload: DescriptionPayload = self.decode()?;
        if payload.description.kind != expected {
            return Err(EnvelopeError::DescriptionMismatch {
                envelope: self.kind,
                description: payload.description.kind,
            });
        }
        Ok(payload)
    }

    pub fn candidate_payload(&self) -> Result<CandidatePayload, EnvelopeError> {
        if self.kind != SignalKind::Candidate {
            return Err(EnvelopeError::WrongKind {
                expected: "candidate",
                found: self.kind,
            });
        }
        self.decode()
    }

    /// An empty payload is a bye for whatever negotiation is current.
    pub fn bye_payload(&self) -> Result<ByePayload, EnvelopeError> {
        if self.kind != SignalKind::Bye {
            return Err(EnvelopeError::WrongKind {
                expected: "bye",
                found: self.kind,
            });
        }
        self.decode()
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(T::deserialize(&self.payload)?)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
