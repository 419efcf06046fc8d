//! Session engine
//!
//! One spawned task owns the mesh, the protocol and the timer set, and
//! reacts to presence snapshots, inbound envelopes, link events, commands
//! and timer deadlines in arrival order. Nothing else touches that state;
//! callers talk to the task through a `SessionHandle`.

use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::models::{MediaItem, Participant, ParticipantId, PlaybackState, PresenceSnapshot, RoomId};
use crate::player::PlayerControl;
use crate::service::webrtc::mesh::MeshStats;
use crate::service::webrtc::{LinkRole, PeerConnectionState, SignalEnvelope};
use crate::service::{MeshEvent, MeshManager, PresenceDirectory, SessionStore, SignalingRelay};
use crate::sync::{
    ChatEntry, Effects, Frame, ItemRequest, LockKind, SessionNotice, SyncProtocol, TimerKind,
    TimerSet,
};
use crate::transport::{LinkNotice, PeerConnector, RoomTransport};
use crate::{Error, Result};

const NOTICE_CAPACITY: usize = 256;

/// Collaborators a session is built from
pub struct SessionParts {
    pub room_id: RoomId,
    pub identity: Participant,
    pub transport: Arc<dyn RoomTransport>,
    pub connector: Arc<dyn PeerConnector>,
    pub player: Box<dyn PlayerControl>,
    pub store: Arc<dyn SessionStore>,
}

/// Callbacks of the local media player
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerEvent {
    Play,
    Pause,
    Buffer,
    Progress(f64),
    Seek(f64),
    Ended,
}

#[derive(Debug)]
pub enum SessionCommand {
    Player(PlayerEvent),
    SelectItem(MediaItem),
    AddToQueue(Vec<MediaItem>),
    ApproveRequest(String),
    DenyRequest(String),
    SetControl {
        participant: ParticipantId,
        granted: bool,
    },
    SendChat(String),
    ForceSync,
    RequestTime,
    Next,
    Previous,
    Leave(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub peer_id: ParticipantId,
    pub label: String,
    pub state: PeerConnectionState,
    pub role: Option<LinkRole>,
}

/// Read-only picture of the session, republished after every step
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub local_id: ParticipantId,
    pub is_host: bool,
    pub has_control: bool,
    pub playback: PlaybackState,
    pub peers: Vec<PeerSummary>,
    pub authorized: Vec<ParticipantId>,
    pub pending_requests: Vec<ItemRequest>,
    pub chat: Vec<ChatEntry>,
    pub locks: Vec<LockKind>,
    pub mesh: MeshStats,
    pub closed: bool,
}

impl SessionView {
    /// Peers whose link is up
    #[must_use]
    pub fn connected_peers(&self) -> Vec<ParticipantId> {
        self.peers
            .iter()
            .filter(|p| p.state == PeerConnectionState::Connected)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    #[must_use]
    pub fn peer_state(&self, peer_id: &ParticipantId) -> PeerConnectionState {
        self.peers
            .iter()
            .find(|p| &p.peer_id == peer_id)
            .map_or(PeerConnectionState::Absent, |p| p.state)
    }
}

/// Cloneable handle onto a running session
#[derive(Clone)]
pub struct SessionHandle {
    local_id: ParticipantId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    view: watch::Receiver<SessionView>,
    notices: broadcast::Sender<SessionNotice>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::SessionClosed)
    }

    #[must_use]
    pub const fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn player_event(&self, event: PlayerEvent) -> Result<()> {
        self.send(SessionCommand::Player(event))
    }

    pub fn select_item(&self, item: MediaItem) -> Result<()> {
        self.send(SessionCommand::SelectItem(item))
    }

    pub fn add_to_queue(&self, items: Vec<MediaItem>) -> Result<()> {
        self.send(SessionCommand::AddToQueue(items))
    }

    pub fn approve_request(&self, request_id: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::ApproveRequest(request_id.into()))
    }

    pub fn deny_request(&self, request_id: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::DenyRequest(request_id.into()))
    }

    pub fn set_control(&self, participant: ParticipantId, granted: bool) -> Result<()> {
        self.send(SessionCommand::SetControl {
            participant,
            granted,
        })
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::SendChat(text.into()))
    }

    pub fn force_sync(&self) -> Result<()> {
        self.send(SessionCommand::ForceSync)
    }

    pub fn request_time(&self) -> Result<()> {
        self.send(SessionCommand::RequestTime)
    }

    pub fn next(&self) -> Result<()> {
        self.send(SessionCommand::Next)
    }

    pub fn previous(&self) -> Result<()> {
        self.send(SessionCommand::Previous)
    }

    /// Tear down every link, cancel every timer and untrack presence
    pub async fn leave(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(SessionCommand::Leave(done_tx))?;
        done_rx.await.map_err(|_| Error::SessionClosed)
    }

    #[must_use]
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn watch_view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }
}

pub struct SessionEngine {
    room_id: RoomId,
    clock: Arc<dyn Clock>,
    presence: PresenceDirectory,
    mesh: MeshManager,
    protocol: SyncProtocol,
    timers: TimerSet,
    persist_tx: mpsc::UnboundedSender<Vec<MediaItem>>,
    view_tx: watch::Sender<SessionView>,
    notice_tx: broadcast::Sender<SessionNotice>,
}

impl SessionEngine {
    /// Join the room and spawn the session task
    ///
    /// Timer deadlines are slept on with tokio's clock, so lock windows and
    /// retries follow paused time in tests.
    pub async fn start(config: &Config, parts: SessionParts) -> Result<SessionHandle> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let SessionParts {
            room_id,
            identity,
            transport,
            connector,
            player,
            store,
        } = parts;

        let stored = store.load_session_state(&room_id).await?;
        let channel = transport.open(&room_id, &identity.id).await?;

        // Listen for handshakes before anyone can see us in presence
        let relay = SignalingRelay::new(
            identity.id.clone(),
            identity.display_name.clone(),
            Arc::clone(&channel),
        );
        let inbound = relay.inbound();

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let mesh = MeshManager::new(relay, connector, link_tx, &config.mesh, Arc::clone(&clock));
        let protocol = SyncProtocol::new(
            identity.clone(),
            &stored,
            config.timings.clone(),
            Arc::clone(&clock),
            player,
        );
        let presence = PresenceDirectory::join(channel, identity.clone()).await?;

        let persist_tx = spawn_queue_writer(room_id.clone(), store);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let (view_tx, view_rx) = watch::channel(empty_view(&identity.id));

        let engine = Self {
            room_id,
            clock,
            presence,
            mesh,
            protocol,
            timers: TimerSet::new(),
            persist_tx,
            view_tx,
            notice_tx: notice_tx.clone(),
        };
        engine.publish_view(false);

        info!(
            room_id = %engine.room_id,
            participant_id = %identity.id,
            host_id = %stored.host_id,
            is_host = engine.protocol.is_host(),
            ice_servers = ?config.mesh.ice_servers,
            "Session started"
        );

        tokio::spawn(engine.run(command_rx, link_rx, inbound));

        Ok(SessionHandle {
            local_id: identity.id,
            commands: command_tx,
            view: view_rx,
            notices: notice_tx,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut link_events: mpsc::UnboundedReceiver<LinkNotice>,
        mut inbound: BoxStream<'static, SignalEnvelope>,
    ) {
        let mut presence_updates = self.presence.updates();

        loop {
            let deadline = self.timers.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                Some(snapshot) = presence_updates.next() => self.on_presence(&snapshot),
                Some(envelope) = inbound.next() => self.mesh.handle_signal(envelope, &mut self.timers),
                Some(notice) = link_events.recv() => self.on_link_notice(notice),
                command = commands.recv() => match command {
                    Some(SessionCommand::Leave(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                () = timer => self.on_timers_due(),
            }

            self.publish_view(false);
        }

        self.publish_view(true);
        debug!(room_id = %self.room_id, "Session task finished");
    }

    fn on_presence(&mut self, snapshot: &PresenceSnapshot) {
        self.mesh.reconcile(snapshot, &mut self.timers);
    }

    fn on_link_notice(&mut self, notice: LinkNotice) {
        let Some(event) = self.mesh.handle_link_event(notice, &mut self.timers) else {
            return;
        };
        match event {
            MeshEvent::PeerConnected { peer_id, .. } => {
                let effects = self.protocol.on_peer_connected(&peer_id);
                self.apply(effects);
            }
            MeshEvent::Frame { peer_id, raw, .. } => match Frame::decode(&raw) {
                Ok(frame) => {
                    let effects = self.protocol.handle_frame(&peer_id, frame, &mut self.timers);
                    self.apply(effects);
                }
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Malformed frame"),
            },
            MeshEvent::PeerLost { peer_id } => {
                debug!(peer_id = %peer_id, "Peer lost");
            }
        }
    }

    fn on_timers_due(&mut self) {
        for kind in self.timers.take_due(self.clock.now()) {
            match kind {
                TimerKind::Reconnect(peer_id) => {
                    self.mesh.on_reconnect_due(&peer_id, &mut self.timers);
                }
                other => {
                    let effects = self.protocol.on_timer(&other);
                    self.apply(effects);
                }
            }
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        let timers = &mut self.timers;
        let protocol = &mut self.protocol;
        let result = match command {
            SessionCommand::Player(event) => Ok(match event {
                PlayerEvent::Play => protocol.on_local_play(timers),
                PlayerEvent::Pause => protocol.on_local_pause(timers),
                PlayerEvent::Buffer => {
                    protocol.on_local_buffer();
                    Effects::default()
                }
                PlayerEvent::Progress(position) => protocol.on_local_progress(position, timers),
                PlayerEvent::Seek(position) => protocol.on_local_seek(position, timers),
                PlayerEvent::Ended => protocol.on_local_ended(timers),
            }),
            SessionCommand::SelectItem(item) => Ok(protocol.select_item(item, timers)),
            SessionCommand::AddToQueue(items) => Ok(protocol.add_to_queue(items, timers)),
            SessionCommand::ApproveRequest(id) => protocol.approve_request(&id, timers),
            SessionCommand::DenyRequest(id) => protocol.deny_request(&id),
            SessionCommand::SetControl {
                participant,
                granted,
            } => protocol.set_control(participant, granted),
            SessionCommand::SendChat(text) => protocol.send_chat(&text),
            SessionCommand::ForceSync => Ok(protocol.force_sync()),
            SessionCommand::RequestTime => Ok(protocol.request_time()),
            SessionCommand::Next => protocol.next(timers),
            SessionCommand::Previous => protocol.previous(timers),
            SessionCommand::Leave(_) => Ok(Effects::default()),
        };

        match result {
            Ok(effects) => self.apply(effects),
            Err(e) => warn!(error = %e, "Session command rejected"),
        }
    }

    /// Route outbound messages, persist the queue, publish notices
    fn apply(&mut self, effects: Effects) {
        let local = self.protocol.local();
        let (sender, sender_label) = (local.id.clone(), local.display_name.clone());

        for outbound in effects.outbound {
            let kind = outbound.message.kind();
            let frame = Frame {
                sender: sender.clone(),
                sender_label: sender_label.clone(),
                target: outbound.target,
                message: outbound.message,
            };
            let raw = match frame.encode() {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(kind, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            match &frame.target {
                Some(target) => {
                    self.mesh.send_to(target, &raw);
                }
                None => {
                    let sent_count = self.mesh.broadcast(&raw);
                    debug!(kind, sent_count, "Broadcast message");
                }
            }
        }

        if let Some(queue) = effects.persist_queue {
            if self.persist_tx.send(queue).is_err() {
                warn!(room_id = %self.room_id, "Queue writer stopped");
            }
        }

        for notice in effects.notices {
            // No subscribers is fine
            let _ = self.notice_tx.send(notice);
        }
    }

    async fn shutdown(&mut self) {
        self.mesh.teardown(&mut self.timers);
        self.timers.clear();
        self.protocol.reset_transient();
        self.presence.leave().await;
        info!(room_id = %self.room_id, participant_id = %self.mesh.local_id(), "Left session");
    }

    fn build_view(&self, closed: bool) -> SessionView {
        let local_id = self.mesh.local_id().clone();
        let snapshot = self.mesh.last_snapshot();

        let mut peers: BTreeMap<ParticipantId, PeerSummary> = snapshot
            .others(&local_id)
            .map(|id| {
                let summary = PeerSummary {
                    peer_id: id.clone(),
                    label: snapshot.display_name(id).unwrap_or(id.as_str()).to_string(),
                    state: self.mesh.state_of(id, &self.timers),
                    role: None,
                };
                (id.clone(), summary)
            })
            .collect();
        for link in self.mesh.links() {
            peers.insert(
                link.peer_id.clone(),
                PeerSummary {
                    peer_id: link.peer_id.clone(),
                    label: link.label.clone(),
                    state: link.state,
                    role: Some(link.role),
                },
            );
        }

        SessionView {
            local_id,
            is_host: self.protocol.is_host(),
            has_control: self.protocol.has_control(),
            playback: self.protocol.state().clone(),
            peers: peers.into_values().collect(),
            authorized: self.protocol.authorization().members(),
            pending_requests: self.protocol.pending_requests().to_vec(),
            chat: self.protocol.chat_log().cloned().collect(),
            locks: self.protocol.locks().into_iter().map(|l| l.kind).collect(),
            mesh: self.mesh.stats(),
            closed,
        }
    }

    fn publish_view(&self, closed: bool) {
        self.view_tx.send_replace(self.build_view(closed));
    }
}

fn empty_view(local_id: &ParticipantId) -> SessionView {
    SessionView {
        local_id: local_id.clone(),
        is_host: false,
        has_control: false,
        playback: PlaybackState::default(),
        peers: Vec::new(),
        authorized: Vec::new(),
        pending_requests: Vec::new(),
        chat: Vec::new(),
        locks: Vec::new(),
        mesh: MeshStats::default(),
        closed: false,
    }
}

/// Mirror host-confirmed queues to the store, one save at a time and in order
fn spawn_queue_writer(
    room_id: RoomId,
    store: Arc<dyn SessionStore>,
) -> mpsc::UnboundedSender<Vec<MediaItem>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<MediaItem>>();
    tokio::spawn(async move {
        while let Some(queue) = rx.recv().await {
            if let Err(e) = store.save_queue(&room_id, &queue).await {
                warn!(room_id = %room_id, error = %e, "Failed to save queue");
            }
        }
    });
    tx
}
