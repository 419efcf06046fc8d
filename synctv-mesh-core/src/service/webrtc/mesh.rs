//! Mesh manager
//!
//! Owns at most one `PeerLink` per remote participant. Reconciles the link
//! set against every presence snapshot, answers inbound handshakes, and
//! retries dropped links it initiated after a fixed delay.
//!
//! The manager never blocks: transports report progress through the
//! `LinkNotice` channel, which the session task feeds back into
//! `handle_link_event`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::peer::{LinkRole, PeerConnectionState, PeerLink};
use super::signaling::SignalingRelay;
use super::{SignalEnvelope, SignalKind};
use crate::clock::Clock;
use crate::config::MeshConfig;
use crate::models::{ParticipantId, PresenceSnapshot};
use crate::sync::timers::{TimerKind, TimerSet};
use crate::transport::{LinkEvent, LinkEventSink, LinkNotice, PeerConnector};

/// Exactly one side of every pair initiates: the one with the greater id
#[must_use]
pub fn should_initiate(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local > remote
}

/// What the rest of the session needs to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    PeerConnected {
        peer_id: ParticipantId,
        label: String,
    },
    /// Raw application frame received on a connected link
    Frame {
        peer_id: ParticipantId,
        label: String,
        raw: String,
    },
    PeerLost {
        peer_id: ParticipantId,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStats {
    pub links: usize,
    pub connected: usize,
    pub initiated: usize,
    pub links_opened: u64,
    pub reconnects_scheduled: u64,
    pub stale_events_dropped: u64,
}

pub struct MeshManager {
    relay: SignalingRelay,
    connector: Arc<dyn PeerConnector>,
    links: HashMap<ParticipantId, PeerLink>,
    last_snapshot: PresenceSnapshot,
    next_generation: u64,
    link_tx: mpsc::UnboundedSender<LinkNotice>,
    reconnect_delay: Duration,
    max_peers: usize,
    clock: Arc<dyn Clock>,
    stats: MeshStats,
}

impl std::fmt::Debug for MeshManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshManager")
            .field("local_id", self.relay.local_id())
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}

impl MeshManager {
    pub fn new(
        relay: SignalingRelay,
        connector: Arc<dyn PeerConnector>,
        link_tx: mpsc::UnboundedSender<LinkNotice>,
        config: &MeshConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            local_id = %relay.local_id(),
            reconnect_delay_ms = config.reconnect_delay_ms,
            max_peers = config.max_peers,
            "Mesh manager initialized"
        );

        Self {
            relay,
            connector,
            links: HashMap::new(),
            last_snapshot: PresenceSnapshot::new(),
            next_generation: 0,
            link_tx,
            reconnect_delay: config.reconnect_delay(),
            max_peers: config.max_peers,
            clock,
            stats: MeshStats::default(),
        }
    }

    #[must_use]
    pub const fn local_id(&self) -> &ParticipantId {
        self.relay.local_id()
    }

    /// Bring the link set in line with `snapshot`
    ///
    /// Links to absent peers are torn down (this also covers missed leave
    /// events); peers without a link get one if the local side is their
    /// initiator, otherwise the manager waits for their offer.
    pub fn reconcile(&mut self, snapshot: &PresenceSnapshot, timers: &mut TimerSet) {
        let delta = snapshot.diff(&self.last_snapshot);
        self.last_snapshot = snapshot.clone();

        for left in &delta.left {
            timers.cancel(&TimerKind::Reconnect(left.clone()));
        }

        let local_id = self.local_id().clone();
        let stale: Vec<ParticipantId> = self
            .links
            .keys()
            .filter(|id| !snapshot.contains(id))
            .cloned()
            .collect();
        for peer_id in stale {
            debug!(peer_id = %peer_id, "Removing link to absent peer");
            self.remove_peer(&peer_id);
        }

        let missing: Vec<(ParticipantId, String)> = snapshot
            .others(&local_id)
            .filter(|id| !self.links.contains_key(*id) && should_initiate(&local_id, id))
            .map(|id| {
                let label = snapshot.display_name(id).unwrap_or(id.as_str()).to_string();
                (id.clone(), label)
            })
            .collect();
        for (peer_id, label) in missing {
            self.create_peer(&peer_id, label, LinkRole::Initiator, timers);
        }

        if !delta.is_empty() {
            info!(
                joined = delta.joined.len(),
                left = delta.left.len(),
                members = snapshot.len(),
                links = self.links.len(),
                "Reconciled mesh with presence"
            );
        }
    }

    /// Open a link to `peer_id` unless one already exists
    ///
    /// The link is registered before the transport reports anything, so
    /// handshake fragments that follow always find it. Any pending retry
    /// for the peer is superseded.
    pub fn create_peer(
        &mut self,
        peer_id: &ParticipantId,
        label: String,
        role: LinkRole,
        timers: &mut TimerSet,
    ) -> bool {
        if self.links.contains_key(peer_id) {
            debug!(peer_id = %peer_id, "Link already exists, skipping create");
            return false;
        }
        if peer_id == self.local_id() {
            warn!(peer_id = %peer_id, "Refusing to link to self");
            return false;
        }
        if self.max_peers > 0 && self.links.len() >= self.max_peers {
            warn!(
                peer_id = %peer_id,
                max_peers = self.max_peers,
                "Peer limit reached, not opening link"
            );
            return false;
        }

        timers.cancel(&TimerKind::Reconnect(peer_id.clone()));

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = LinkEventSink::new(peer_id.clone(), generation, self.link_tx.clone());

        match self.connector.open(peer_id, role, sink) {
            Ok(transport) => {
                let link = PeerLink::new(
                    peer_id.clone(),
                    label,
                    role,
                    generation,
                    transport,
                    self.clock.now(),
                );
                self.links.insert(peer_id.clone(), link);
                self.stats.links_opened += 1;

                info!(
                    peer_id = %peer_id,
                    role = ?role,
                    generation,
                    "Opened peer link"
                );
                true
            }
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Failed to open peer link");
                false
            }
        }
    }

    /// Apply an inbound handshake fragment
    pub fn handle_signal(&mut self, envelope: SignalEnvelope, timers: &mut TimerSet) {
        if !self.relay.accepts(&envelope) {
            return;
        }

        let peer_id = envelope.sender;
        let kind = envelope.signal.kind();

        if !self.links.contains_key(&peer_id) {
            // Only an offer opens a link; anything else belongs to a link
            // we already dropped
            if kind != SignalKind::Offer {
                debug!(
                    peer_id = %peer_id,
                    kind = kind.as_str(),
                    "Dropping fragment for a link we no longer hold"
                );
                return;
            }
            self.create_peer(&peer_id, envelope.sender_label, LinkRole::Responder, timers);
        }

        let Some(link) = self.links.get_mut(&peer_id) else {
            return;
        };

        if link.is_connected() && kind.is_session_description() {
            debug!(
                peer_id = %peer_id,
                kind = kind.as_str(),
                "Ignoring session description on connected link"
            );
            return;
        }

        if let Err(e) = link.transport_mut().signal(envelope.signal) {
            warn!(
                peer_id = %peer_id,
                kind = kind.as_str(),
                error = %e,
                "Failed to apply signal"
            );
        }
    }

    /// React to a transport notice; notices from superseded links are dropped
    pub fn handle_link_event(
        &mut self,
        notice: LinkNotice,
        timers: &mut TimerSet,
    ) -> Option<MeshEvent> {
        let LinkNotice {
            peer_id,
            generation,
            event,
        } = notice;

        let Some(link) = self
            .links
            .get_mut(&peer_id)
            .filter(|link| link.generation == generation)
        else {
            debug!(peer_id = %peer_id, generation, "Dropping event from stale link");
            self.stats.stale_events_dropped += 1;
            return None;
        };

        match event {
            LinkEvent::Signal(payload) => {
                self.relay.send(&peer_id, payload);
                None
            }
            LinkEvent::Connected => {
                if link.is_connected() {
                    return None;
                }
                link.mark_connected(self.clock.now());
                info!(peer_id = %peer_id, role = ?link.role, "Peer link connected");
                Some(MeshEvent::PeerConnected {
                    label: link.label.clone(),
                    peer_id,
                })
            }
            LinkEvent::Data(raw) => Some(MeshEvent::Frame {
                label: link.label.clone(),
                peer_id,
                raw,
            }),
            LinkEvent::Closed | LinkEvent::Error(_) => {
                let role = link.role;
                match &event {
                    LinkEvent::Error(reason) => {
                        warn!(peer_id = %peer_id, reason = %reason, "Peer link failed");
                    }
                    _ => info!(peer_id = %peer_id, "Peer link closed"),
                }
                self.remove_peer(&peer_id);

                let retry = TimerKind::Reconnect(peer_id.clone());
                if role.is_initiator()
                    && self.last_snapshot.contains(&peer_id)
                    && !timers.is_pending(&retry)
                {
                    timers.schedule(retry, self.clock.now() + self.reconnect_delay);
                    self.stats.reconnects_scheduled += 1;
                    info!(
                        peer_id = %peer_id,
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "Scheduled reconnect"
                    );
                }
                Some(MeshEvent::PeerLost { peer_id })
            }
        }
    }

    /// A reconnect timer fired
    pub fn on_reconnect_due(&mut self, peer_id: &ParticipantId, timers: &mut TimerSet) {
        let Some(label) = self.last_snapshot.display_name(peer_id).map(str::to_string) else {
            debug!(peer_id = %peer_id, "Peer left before reconnect, skipping");
            return;
        };
        self.create_peer(peer_id, label, LinkRole::Initiator, timers);
    }

    /// Destroy the link to `peer_id`; destruction errors are logged only
    pub fn remove_peer(&mut self, peer_id: &ParticipantId) -> bool {
        let Some(mut link) = self.links.remove(peer_id) else {
            return false;
        };
        if let Err(e) = link.close() {
            warn!(peer_id = %peer_id, error = %e, "Error destroying peer link");
        }
        debug!(peer_id = %peer_id, generation = link.generation, "Removed peer link");
        true
    }

    /// Drop every link and every pending retry
    pub fn teardown(&mut self, timers: &mut TimerSet) {
        let peers: Vec<ParticipantId> = self
            .links
            .keys()
            .chain(self.last_snapshot.ids())
            .cloned()
            .collect();
        for peer_id in &peers {
            timers.cancel(&TimerKind::Reconnect(peer_id.clone()));
            self.remove_peer(peer_id);
        }
        self.last_snapshot = PresenceSnapshot::new();
        info!(local_id = %self.local_id(), "Mesh torn down");
    }

    /// Send one frame on a connected link
    pub fn send_to(&mut self, peer_id: &ParticipantId, frame: &str) -> bool {
        let Some(link) = self.links.get_mut(peer_id).filter(|link| link.is_connected()) else {
            debug!(peer_id = %peer_id, "Peer not connected, dropping direct frame");
            return false;
        };
        match link.transport_mut().send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Failed to send frame");
                false
            }
        }
    }

    /// Send one frame on every connected link; returns how many accepted it
    pub fn broadcast(&mut self, frame: &str) -> usize {
        let mut sent_count = 0;
        for (peer_id, link) in self.links.iter_mut().filter(|(_, link)| link.is_connected()) {
            match link.transport_mut().send(frame) {
                Ok(()) => sent_count += 1,
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Failed to broadcast frame"),
            }
        }
        sent_count
    }

    #[must_use]
    pub fn state_of(&self, peer_id: &ParticipantId, timers: &TimerSet) -> PeerConnectionState {
        match self.links.get(peer_id) {
            Some(link) => link.state,
            None if timers.is_pending(&TimerKind::Reconnect(peer_id.clone())) => {
                PeerConnectionState::Reconnecting
            }
            None => PeerConnectionState::Absent,
        }
    }

    #[must_use]
    pub fn connected_peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<ParticipantId> = self
            .links
            .values()
            .filter(|link| link.is_connected())
            .map(|link| link.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub const fn last_snapshot(&self) -> &PresenceSnapshot {
        &self.last_snapshot
    }

    #[must_use]
    pub fn stats(&self) -> MeshStats {
        MeshStats {
            links: self.links.len(),
            connected: self.links.values().filter(|l| l.is_connected()).count(),
            initiated: self.links.values().filter(|l| l.role.is_initiator()).count(),
            ..self.stats.clone()
        }
    }
}
