//! Peer link state
//!
//! A `PeerLink` is the mesh's record of one direct connection: who it is
//! to, which side started the handshake, how far it got, and the transport
//! doing the work.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::models::ParticipantId;
use crate::transport::PeerTransport;

/// Which side of the pair starts the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    Initiator,
    Responder,
}

impl LinkRole {
    #[must_use]
    pub const fn is_initiator(&self) -> bool {
        matches!(self, Self::Initiator)
    }
}

/// Per-peer connection lifecycle
///
/// `Absent -> Connecting -> Connected -> (Closed | Reconnecting) -> Absent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    Absent,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

pub struct PeerLink {
    pub peer_id: ParticipantId,
    pub label: String,
    pub role: LinkRole,
    pub state: PeerConnectionState,
    pub generation: u64,
    pub created_at: Instant,
    pub connected_at: Option<Instant>,
    transport: Box<dyn PeerTransport>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    #[must_use]
    pub fn new(
        peer_id: ParticipantId,
        label: String,
        role: LinkRole,
        generation: u64,
        transport: Box<dyn PeerTransport>,
        now: Instant,
    ) -> Self {
        Self {
            peer_id,
            label,
            role,
            state: PeerConnectionState::Connecting,
            generation,
            created_at: now,
            connected_at: None,
            transport,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == PeerConnectionState::Connected
    }

    pub fn mark_connected(&mut self, now: Instant) {
        self.state = PeerConnectionState::Connected;
        self.connected_at = Some(now);
    }

    pub fn transport_mut(&mut self) -> &mut dyn PeerTransport {
        self.transport.as_mut()
    }

    /// Destroy the transport; the link is closed whatever the outcome
    pub fn close(&mut self) -> crate::Result<()> {
        self.state = PeerConnectionState::Closed;
        self.transport.destroy()
    }
}
