//! In-process transports
//!
//! `MemoryRoomHub` is a presence + broadcast bus for any number of rooms,
//! and `MemoryPeerNetwork` simulates offer/answer data channels between
//! participants. Both are used by the demo binary and the scenario tests.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use super::{
    ChannelEvent, LinkEvent, LinkEventSink, PeerConnector, PeerTransport, RoomChannel,
    RoomTransport,
};
use crate::models::{ParticipantId, PresenceRecord, PresenceSnapshot, RoomId};
use crate::service::webrtc::{LinkRole, SignalEnvelope, SignalKind, SignalPayload};
use crate::{Error, Result};

/// Channel subscriber bound to one member
#[derive(Debug, Clone)]
struct Subscriber {
    member: ParticipantId,
    sender: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Debug, Default)]
struct RoomEntry {
    presence: PresenceSnapshot,
    subscribers: Vec<Subscriber>,
}

impl RoomEntry {
    /// Send to every subscriber except those bound to `exclude`; subscribers
    /// whose receiver is gone are pruned
    fn broadcast(&mut self, event: &ChannelEvent, exclude: Option<&ParticipantId>) -> usize {
        let mut sent_count = 0;
        self.subscribers.retain(|subscriber| {
            if exclude == Some(&subscriber.member) {
                return true;
            }
            if subscriber.sender.send(event.clone()).is_ok() {
                sent_count += 1;
                true
            } else {
                debug!(member = %subscriber.member, "Dropping closed room subscriber");
                false
            }
        });
        sent_count
    }
}

/// In-memory presence + broadcast bus
#[derive(Clone, Default)]
pub struct MemoryRoomHub {
    rooms: Arc<DashMap<RoomId, RoomEntry>>,
}

impl MemoryRoomHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&self, room_id: &RoomId, member: &ParticipantId) -> BoxStream<'static, ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms
            .entry(room_id.clone())
            .or_default()
            .subscribers
            .push(Subscriber {
                member: member.clone(),
                sender: tx,
            });
        UnboundedReceiverStream::new(rx).boxed()
    }

    fn track(&self, room_id: &RoomId, record: PresenceRecord) {
        let mut room = self.rooms.entry(room_id.clone()).or_default();
        let participant_id = record.participant_id.clone();
        room.presence.insert(record);

        let snapshot = room.presence.clone();
        room.broadcast(&ChannelEvent::PresenceJoin { participant_id: participant_id.clone() }, None);
        room.broadcast(&ChannelEvent::PresenceSync(snapshot), None);

        info!(
            room_id = %room_id,
            participant_id = %participant_id,
            members = room.presence.len(),
            "Member tracked"
        );
    }

    fn untrack(&self, room_id: &RoomId, member: &ParticipantId) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            if room.presence.remove(member).is_none() {
                return;
            }
            let snapshot = room.presence.clone();
            room.broadcast(&ChannelEvent::PresenceLeave { participant_id: member.clone() }, None);
            room.broadcast(&ChannelEvent::PresenceSync(snapshot), None);

            info!(
                room_id = %room_id,
                participant_id = %member,
                members = room.presence.len(),
                "Member untracked"
            );
        }
    }

    fn broadcast_signal(&self, room_id: &RoomId, envelope: SignalEnvelope) -> usize {
        let sender = envelope.sender.clone();
        self.rooms.get_mut(room_id).map_or(0, |mut room| {
            room.broadcast(&ChannelEvent::Signal(envelope), Some(&sender))
        })
    }

    /// Current membership of a room
    #[must_use]
    pub fn presence(&self, room_id: &RoomId) -> PresenceSnapshot {
        self.rooms
            .get(room_id)
            .map(|room| room.presence.clone())
            .unwrap_or_default()
    }

    /// Simulate the channel connection of `member` dropping
    pub fn disconnect(&self, room_id: &RoomId, member: &ParticipantId) {
        if let Some(room) = self.rooms.get(room_id) {
            for subscriber in room.subscribers.iter().filter(|s| &s.member == member) {
                let _ = subscriber.sender.send(ChannelEvent::Disconnected);
            }
        }
        warn!(room_id = %room_id, participant_id = %member, "Simulated channel disconnect");
    }

    /// Re-send the current membership to every subscriber
    pub fn resync(&self, room_id: &RoomId) -> usize {
        self.rooms.get_mut(room_id).map_or(0, |mut room| {
            let snapshot = room.presence.clone();
            room.broadcast(&ChannelEvent::PresenceSync(snapshot), None)
        })
    }

    #[must_use]
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.subscribers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RoomTransport for MemoryRoomHub {
    async fn open(&self, room_id: &RoomId, member: &ParticipantId) -> Result<Arc<dyn RoomChannel>> {
        Ok(Arc::new(MemoryRoomChannel {
            hub: self.clone(),
            room_id: room_id.clone(),
            member: member.clone(),
        }))
    }
}

/// A member's handle onto a `MemoryRoomHub` room
pub struct MemoryRoomChannel {
    hub: MemoryRoomHub,
    room_id: RoomId,
    member: ParticipantId,
}

#[async_trait]
impl RoomChannel for MemoryRoomChannel {
    async fn track(&self, record: PresenceRecord) -> Result<()> {
        if record.participant_id != self.member {
            return Err(Error::InvalidInput(format!(
                "channel bound to {} cannot track {}",
                self.member, record.participant_id
            )));
        }
        self.hub.track(&self.room_id, record);
        Ok(())
    }

    async fn untrack(&self) -> Result<()> {
        self.hub.untrack(&self.room_id, &self.member);
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, ChannelEvent> {
        self.hub.subscribe(&self.room_id, &self.member)
    }

    fn send_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        if envelope.sender != self.member {
            return Err(Error::Signaling("envelope sender does not match channel member".to_string()));
        }
        self.hub.broadcast_signal(&self.room_id, envelope);
        Ok(())
    }
}

#[derive(Debug)]
struct Endpoint {
    sink: LinkEventSink,
    role: LinkRole,
    connected: bool,
}

type EndpointKey = (ParticipantId, ParticipantId);

/// Simulated direct data channels
///
/// Endpoints are keyed by `(local, remote)`. The initiator emits an offer on
/// open, the responder answers it, and both sides report `Connected` once the
/// initiator applies the answer.
#[derive(Clone, Default)]
pub struct MemoryPeerNetwork {
    endpoints: Arc<Mutex<HashMap<EndpointKey, Endpoint>>>,
}

impl MemoryPeerNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connector(&self, local: ParticipantId) -> Arc<dyn PeerConnector> {
        Arc::new(MemoryConnector {
            local,
            network: self.clone(),
        })
    }

    /// Both directions of `a <-> b` report a connected data channel
    #[must_use]
    pub fn is_connected(&self, a: &ParticipantId, b: &ParticipantId) -> bool {
        let endpoints = self.endpoints.lock();
        let forward = endpoints.get(&(a.clone(), b.clone())).is_some_and(|e| e.connected);
        let backward = endpoints.get(&(b.clone(), a.clone())).is_some_and(|e| e.connected);
        forward && backward
    }

    /// Number of live endpoints (two per fully open link)
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Simulate a network failure between `a` and `b`; both sides see an error
    pub fn sever(&self, a: &ParticipantId, b: &ParticipantId) -> bool {
        let mut endpoints = self.endpoints.lock();
        let mut severed = false;
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(endpoint) = endpoints.remove(&key) {
                endpoint.sink.emit(LinkEvent::Error("link severed".to_string()));
                severed = true;
            }
        }
        if severed {
            warn!(a = %a, b = %b, "Simulated link failure");
        }
        severed
    }
}

struct MemoryConnector {
    local: ParticipantId,
    network: MemoryPeerNetwork,
}

impl PeerConnector for MemoryConnector {
    fn open(
        &self,
        peer_id: &ParticipantId,
        role: LinkRole,
        sink: LinkEventSink,
    ) -> Result<Box<dyn PeerTransport>> {
        let generation = sink.generation();
        if role.is_initiator() {
            sink.emit(LinkEvent::Signal(SignalPayload::offer(format!(
                "mem:{}->{}#{generation}",
                self.local, peer_id
            ))));
        }

        self.network.endpoints.lock().insert(
            (self.local.clone(), peer_id.clone()),
            Endpoint {
                sink,
                role,
                connected: false,
            },
        );

        Ok(Box::new(MemoryLink {
            local: self.local.clone(),
            peer: peer_id.clone(),
            generation,
            network: self.network.clone(),
        }))
    }
}

struct MemoryLink {
    local: ParticipantId,
    peer: ParticipantId,
    generation: u64,
    network: MemoryPeerNetwork,
}

impl MemoryLink {
    fn key(&self) -> EndpointKey {
        (self.local.clone(), self.peer.clone())
    }

    fn remote_key(&self) -> EndpointKey {
        (self.peer.clone(), self.local.clone())
    }
}

impl PeerTransport for MemoryLink {
    fn signal(&mut self, payload: SignalPayload) -> Result<()> {
        let mut endpoints = self.network.endpoints.lock();
        let (role, connected) = match endpoints.get(&self.key()) {
            Some(endpoint) if endpoint.sink.generation() == self.generation => {
                (endpoint.role, endpoint.connected)
            }
            _ => return Err(Error::Transport("link destroyed".to_string())),
        };

        match payload.kind() {
            SignalKind::Offer => {
                if role.is_initiator() || connected {
                    return Err(Error::Signaling("unexpected offer in current state".to_string()));
                }
                if let Some(endpoint) = endpoints.get(&self.key()) {
                    endpoint.sink.emit(LinkEvent::Signal(SignalPayload::answer(format!(
                        "mem:{}->{}#{}",
                        self.local, self.peer, self.generation
                    ))));
                }
                Ok(())
            }
            SignalKind::Answer => {
                if !role.is_initiator() || connected {
                    return Err(Error::Signaling("unexpected answer in current state".to_string()));
                }
                let Some(remote) = endpoints.get_mut(&self.remote_key()) else {
                    return Err(Error::Transport("remote endpoint unavailable".to_string()));
                };
                remote.connected = true;
                remote.sink.emit(LinkEvent::Connected);

                if let Some(endpoint) = endpoints.get_mut(&self.key()) {
                    endpoint.connected = true;
                    endpoint.sink.emit(LinkEvent::Connected);
                }
                Ok(())
            }
            SignalKind::Candidate | SignalKind::Renegotiate | SignalKind::Other => Ok(()),
        }
    }

    fn send(&mut self, frame: &str) -> Result<()> {
        let endpoints = self.network.endpoints.lock();
        let local_open = endpoints
            .get(&self.key())
            .is_some_and(|e| e.connected && e.sink.generation() == self.generation);
        match endpoints.get(&self.remote_key()) {
            Some(remote) if local_open && remote.connected => {
                remote.sink.emit(LinkEvent::Data(frame.to_string()));
                Ok(())
            }
            _ => Err(Error::Transport("data channel not open".to_string())),
        }
    }

    fn destroy(&mut self) -> Result<()> {
        let mut endpoints = self.network.endpoints.lock();
        let owned = endpoints
            .get(&self.key())
            .is_some_and(|e| e.sink.generation() == self.generation);
        if !owned {
            return Ok(());
        }
        endpoints.remove(&self.key());

        if let Some(remote) = endpoints.get_mut(&self.remote_key()) {
            if remote.connected {
                remote.connected = false;
                remote.sink.emit(LinkEvent::Closed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LinkNotice;

    fn drain(rx: &mut mpsc::UnboundedReceiver<LinkNotice>) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            events.push(notice.event);
        }
        events
    }

    #[test]
    fn test_offer_answer_connects_both_sides() {
        let network = MemoryPeerNetwork::new();
        let (a, b) = (ParticipantId::from("a"), ParticipantId::from("b"));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let mut link_b = network
            .connector(b.clone())
            .open(&a, LinkRole::Initiator, LinkEventSink::new(a.clone(), 1, tx_b))
            .unwrap();
        let offer = match drain(&mut rx_b).pop() {
            Some(LinkEvent::Signal(payload)) => payload,
            other => panic!("expected offer, got {other:?}"),
        };
        assert_eq!(offer.kind(), SignalKind::Offer);

        let mut link_a = network
            .connector(a.clone())
            .open(&b, LinkRole::Responder, LinkEventSink::new(b.clone(), 1, tx_a))
            .unwrap();
        link_a.signal(offer).unwrap();
        let answer = match drain(&mut rx_a).pop() {
            Some(LinkEvent::Signal(payload)) => payload,
            other => panic!("expected answer, got {other:?}"),
        };

        link_b.signal(answer.clone()).unwrap();
        assert_eq!(drain(&mut rx_a), vec![LinkEvent::Connected]);
        assert_eq!(drain(&mut rx_b), vec![LinkEvent::Connected]);
        assert!(network.is_connected(&a, &b));

        // A late duplicate answer is an invalid-state error
        assert!(link_b.signal(answer).is_err());

        link_b.send("hello").unwrap();
        assert_eq!(drain(&mut rx_a), vec![LinkEvent::Data("hello".to_string())]);

        link_b.destroy().unwrap();
        assert_eq!(drain(&mut rx_a), vec![LinkEvent::Closed]);
        assert!(link_a.send("late").is_err());
    }

    #[test]
    fn test_sever_reports_errors() {
        let network = MemoryPeerNetwork::new();
        let (a, b) = (ParticipantId::from("a"), ParticipantId::from("b"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _link = network
            .connector(a.clone())
            .open(&b, LinkRole::Responder, LinkEventSink::new(b.clone(), 3, tx))
            .unwrap();
        assert!(network.sever(&a, &b));
        assert_eq!(drain(&mut rx), vec![LinkEvent::Error("link severed".to_string())]);
        assert_eq!(network.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_hub_presence_and_signal_fanout() {
        let hub = MemoryRoomHub::new();
        let room = RoomId::from("r");
        let (a, b) = (ParticipantId::from("a"), ParticipantId::from("b"));
        let chan_a = hub.open(&room, &a).await.unwrap();
        let chan_b = hub.open(&room, &b).await.unwrap();
        let mut events_a = chan_a.subscribe();

        chan_a.track(PresenceRecord::new(a.clone(), "A")).await.unwrap();
        chan_b.track(PresenceRecord::new(b.clone(), "B")).await.unwrap();
        assert_eq!(hub.presence(&room).len(), 2);

        // Broadcasts exclude the sender
        chan_a
            .send_signal(SignalEnvelope {
                target: b.clone(),
                sender: a.clone(),
                sender_label: "A".to_string(),
                signal: SignalPayload::offer("x"),
            })
            .unwrap();

        let mut saw_signal = false;
        let mut last_sync = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), events_a.next()).await
        {
            match event {
                ChannelEvent::Signal(_) => saw_signal = true,
                ChannelEvent::PresenceSync(snapshot) => last_sync = Some(snapshot),
                _ => {}
            }
        }
        assert!(!saw_signal);
        assert_eq!(last_sync.map(|s| s.len()), Some(2));

        assert!(chan_a.track(PresenceRecord::new(b.clone(), "B")).await.is_err());
    }
}
