//! Transport seams
//!
//! The engine only specifies the protocol built on top of two primitives it
//! does not own: a per-room presence/broadcast channel, and a direct
//! peer-to-peer data channel. Both are traits here; `memory` provides
//! in-process implementations.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::models::{ParticipantId, PresenceRecord, PresenceSnapshot, RoomId};
use crate::service::webrtc::{LinkRole, SignalEnvelope, SignalPayload};
use crate::Result;

pub use memory::{MemoryPeerNetwork, MemoryRoomHub};

/// Event delivered by the shared room channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Full membership, sent after every change
    PresenceSync(PresenceSnapshot),
    PresenceJoin { participant_id: ParticipantId },
    PresenceLeave { participant_id: ParticipantId },
    /// A handshake envelope broadcast on the channel (not yet filtered by target)
    Signal(SignalEnvelope),
    /// The channel itself lost its connection
    Disconnected,
}

/// Presence + broadcast channel for a single room, bound to one member
#[async_trait]
pub trait RoomChannel: Send + Sync {
    /// Announce the local member with its metadata
    async fn track(&self, record: PresenceRecord) -> Result<()>;

    /// Withdraw the local member
    async fn untrack(&self) -> Result<()>;

    /// Stream of channel events for this member, starting now
    fn subscribe(&self) -> BoxStream<'static, ChannelEvent>;

    /// Broadcast a handshake envelope to the room (fire-and-forget)
    fn send_signal(&self, envelope: SignalEnvelope) -> Result<()>;
}

/// Factory for room channels
#[async_trait]
pub trait RoomTransport: Send + Sync {
    async fn open(&self, room_id: &RoomId, member: &ParticipantId) -> Result<Arc<dyn RoomChannel>>;
}

/// Event raised by a direct peer link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Outgoing handshake fragment to relay to the remote side
    Signal(SignalPayload),
    Connected,
    /// Inbound application frame (UTF-8 JSON)
    Data(String),
    Closed,
    Error(String),
}

/// A link event tagged with the link it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct LinkNotice {
    pub peer_id: ParticipantId,
    pub generation: u64,
    pub event: LinkEvent,
}

/// Where a transport reports its events
///
/// Every link gets its own generation number; the mesh discards notices of
/// generations it no longer holds.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    peer_id: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkNotice>,
}

impl LinkEventSink {
    #[must_use]
    pub const fn new(
        peer_id: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<LinkNotice>,
    ) -> Self {
        Self {
            peer_id,
            generation,
            tx,
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false when the receiving side is gone
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkNotice {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One direct data channel to a remote participant
pub trait PeerTransport: Send {
    /// Apply an inbound handshake fragment
    fn signal(&mut self, payload: SignalPayload) -> Result<()>;

    /// Send one application frame
    fn send(&mut self, frame: &str) -> Result<()>;

    /// Release every resource held by the link
    fn destroy(&mut self) -> Result<()>;
}

/// Opens direct links; the returned transport starts its handshake
/// asynchronously and reports progress through `sink`
pub trait PeerConnector: Send + Sync {
    fn open(
        &self,
        peer_id: &ParticipantId,
        role: LinkRole,
        sink: LinkEventSink,
    ) -> Result<Box<dyn PeerTransport>>;
}
