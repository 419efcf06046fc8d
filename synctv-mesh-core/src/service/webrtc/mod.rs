//! Direct peer links
//!
//! Handshake vocabulary, the signaling relay that carries it over the room
//! channel, and the mesh manager that owns one link per remote participant.

pub mod mesh;
pub mod peer;
pub mod signaling;

pub use mesh::{should_initiate, MeshEvent, MeshManager};
pub use peer::{LinkRole, PeerConnectionState, PeerLink};
pub use signaling::SignalingRelay;

use serde::{Deserialize, Serialize};

use crate::models::ParticipantId;

/// Kind of handshake fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Renegotiate,
    Other,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Renegotiate => "renegotiate",
            Self::Other => "other",
        }
    }

    /// Offer and answer are only valid before a link is stable
    #[must_use]
    pub const fn is_session_description(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

/// Opaque handshake fragment produced and consumed by the peer transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub serde_json::Value);

impl SignalPayload {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self(serde_json::json!({ "type": "offer", "sdp": sdp.into() }))
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self(serde_json::json!({ "type": "answer", "sdp": sdp.into() }))
    }

    pub fn candidate(candidate: impl Into<String>, sdp_mid: Option<String>) -> Self {
        Self(serde_json::json!({
            "type": "candidate",
            "candidate": { "candidate": candidate.into(), "sdpMid": sdp_mid },
        }))
    }

    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self.0.get("type").and_then(serde_json::Value::as_str) {
            Some("offer") => SignalKind::Offer,
            Some("answer") => SignalKind::Answer,
            Some("candidate") => SignalKind::Candidate,
            Some("renegotiate") => SignalKind::Renegotiate,
            _ if self.0.get("candidate").is_some() => SignalKind::Candidate,
            _ => SignalKind::Other,
        }
    }
}

/// Handshake fragment addressed to exactly one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub target: ParticipantId,
    pub sender: ParticipantId,
    pub sender_label: String,
    pub signal: SignalPayload,
}
