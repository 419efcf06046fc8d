//! Sync protocol
//!
//! Pure state machine over the local playback replica. Inbound frames,
//! local player events, user actions and timer expiries go in; `Effects`
//! (messages to send, a queue to persist, notices for the UI) come out.
//! All timing goes through the injected clock and the caller's `TimerSet`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::authorization::AuthorizationSet;
use super::lock::{LocalEvent, LockKind, LockState, PlaybackLockController};
use super::messages::{Frame, Outbound, SyncMessage};
use super::timers::{TimerKind, TimerSet};
use crate::clock::Clock;
use crate::config::SyncTimings;
use crate::models::{generate_id, MediaItem, Participant, ParticipantId, PlaybackSnapshot, PlaybackState};
use crate::player::PlayerControl;
use crate::service::StoredSession;
use crate::{Error, Result};

/// A guest's pending request for an item, held by the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemRequest {
    pub id: String,
    pub item: MediaItem,
    pub requested_by: ParticipantId,
    pub label: String,
    pub play_now: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatEntry {
    pub sender: ParticipantId,
    pub label: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Something the user interface should hear about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionNotice {
    ChatReceived(ChatEntry),
    ItemRequested(ItemRequest),
    Hydrated { position: f64 },
    ControlChanged { granted: bool },
}

/// Output of one protocol step
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    /// Host-confirmed queue to mirror to the store
    pub persist_queue: Option<Vec<MediaItem>>,
    pub notices: Vec<SessionNotice>,
}

impl Effects {
    fn broadcast(&mut self, message: SyncMessage) {
        self.outbound.push(Outbound::broadcast(message));
    }

    fn direct(&mut self, target: ParticipantId, message: SyncMessage) {
        self.outbound.push(Outbound::direct(target, message));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.persist_queue.is_none() && self.notices.is_empty()
    }
}

pub struct SyncProtocol {
    local: Participant,
    state: PlaybackState,
    auth: AuthorizationSet,
    locks: PlaybackLockController,
    timings: SyncTimings,
    clock: Arc<dyn Clock>,
    player: Box<dyn PlayerControl>,
    pending_hydration_seek: Option<f64>,
    requests: Vec<ItemRequest>,
    chat: VecDeque<ChatEntry>,
    last_progress: Option<f64>,
}

impl std::fmt::Debug for SyncProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocol")
            .field("local", &self.local.id)
            .field("host", self.auth.host())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SyncProtocol {
    pub fn new(
        local: Participant,
        session: &StoredSession,
        timings: SyncTimings,
        clock: Arc<dyn Clock>,
        player: Box<dyn PlayerControl>,
    ) -> Self {
        let auth = AuthorizationSet::with_members(
            session.host_id.clone(),
            session.authorization_seed.iter().cloned(),
        );
        let locks = PlaybackLockController::new(Arc::clone(&clock), timings.lock_durations());

        Self {
            local,
            state: PlaybackState::with_queue(session.queue.clone()),
            auth,
            locks,
            timings,
            clock,
            player,
            pending_hydration_seek: None,
            requests: Vec::new(),
            chat: VecDeque::new(),
            last_progress: None,
        }
    }

    #[must_use]
    pub fn is_host(&self) -> bool {
        self.auth.is_host(&self.local.id)
    }

    #[must_use]
    pub fn has_control(&self) -> bool {
        self.auth.permits(&self.local.id)
    }

    #[must_use]
    pub const fn local(&self) -> &Participant {
        &self.local
    }

    #[must_use]
    pub const fn state(&self) -> &PlaybackState {
        &self.state
    }

    #[must_use]
    pub const fn authorization(&self) -> &AuthorizationSet {
        &self.auth
    }

    #[must_use]
    pub fn pending_requests(&self) -> &[ItemRequest] {
        &self.requests
    }

    pub fn chat_log(&self) -> impl Iterator<Item = &ChatEntry> {
        self.chat.iter()
    }

    #[must_use]
    pub fn locks(&self) -> Vec<LockState> {
        self.locks.locks()
    }

    #[must_use]
    pub fn is_locked(&self, kind: LockKind) -> bool {
        self.locks.is_active(kind)
    }

    fn host_id(&self) -> ParticipantId {
        self.auth.host().clone()
    }

    fn record_chat(&mut self, entry: ChatEntry) {
        self.chat.push_back(entry);
        while self.chat.len() > self.timings.chat_history.max(1) {
            self.chat.pop_front();
        }
    }

    fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot::capture(&self.state, self.player.current_time())
    }

    fn switch_locally(&mut self, item: MediaItem, effects: &mut Effects, timers: &mut TimerSet) {
        timers.cancel(&TimerKind::PauseDebounce);
        self.state.switch_item(item.clone());
        self.last_progress = Some(0.0);
        effects.broadcast(SyncMessage::PlayItem { item });
    }

    /// Append unless already queued; returns whether the queue changed
    fn enqueue_unique(&mut self, item: MediaItem) -> bool {
        if self.state.queue.iter().any(|queued| queued.same_item(&item)) {
            return false;
        }
        self.state.enqueue(item);
        true
    }

    fn persist_if_host(&self, effects: &mut Effects) {
        if self.is_host() {
            effects.persist_queue = Some(self.state.queue.clone());
        }
    }

    // --- inbound -----------------------------------------------------------

    /// Apply a frame received on the link to `link_peer`
    ///
    /// The link identity is what gets authorized; the frame's own `sender`
    /// field is only compared against it.
    pub fn handle_frame(
        &mut self,
        link_peer: &ParticipantId,
        frame: Frame,
        timers: &mut TimerSet,
    ) -> Effects {
        let mut effects = Effects::default();
        let Frame {
            sender,
            sender_label,
            target,
            message,
        } = frame;

        if &sender != link_peer {
            warn!(
                link_peer = %link_peer,
                claimed_sender = %sender,
                kind = message.kind(),
                "Frame sender does not match link, using link identity"
            );
        }
        if let Some(target) = target.filter(|t| t != &self.local.id) {
            debug!(target_id = %target, kind = message.kind(), "Dropping frame addressed elsewhere");
            return effects;
        }

        let sender = link_peer.clone();
        if self.is_host() && message.is_control() && !self.auth.permits(&sender) {
            debug!(sender = %sender, kind = message.kind(), "Dropped unauthorized control message");
            return effects;
        }
        if message.is_host_only() && !self.auth.is_host(&sender) {
            debug!(sender = %sender, kind = message.kind(), "Dropped host-only message from guest");
            return effects;
        }

        trace!(sender = %sender, kind = message.kind(), "Applying frame");
        match message {
            SyncMessage::Chat { text } => {
                let entry = ChatEntry {
                    sender,
                    label: sender_label,
                    text,
                    sent_at: Utc::now(),
                };
                self.record_chat(entry.clone());
                effects.notices.push(SessionNotice::ChatReceived(entry));
            }
            SyncMessage::Play { position } => {
                timers.cancel(&TimerKind::PauseDebounce);
                self.locks.engage(LockKind::EchoSuppress);
                let drift = (self.player.current_time() - position).abs();
                if drift > self.timings.play_drift_tolerance_secs {
                    self.player.seek_to(position);
                    self.last_progress = Some(position);
                }
                self.state.play();
                self.state.observe_position(position);
            }
            SyncMessage::Pause => {
                timers.cancel(&TimerKind::PauseDebounce);
                self.locks.engage(LockKind::EchoSuppress);
                self.state.pause();
            }
            SyncMessage::Seek { position } => {
                timers.cancel(&TimerKind::PauseDebounce);
                self.locks
                    .engage_for(LockKind::EchoSuppress, self.timings.remote_seek_settle());
                self.player.seek_to(position);
                self.state.seek(position);
                self.last_progress = Some(position);
            }
            SyncMessage::PlayItem { item } => {
                if self.state.is_current(&item) {
                    debug!(item_id = %item.id, "Item already current, keeping position");
                    if !self.state.is_playing {
                        self.locks.engage(LockKind::EchoSuppress);
                        self.state.play();
                    }
                } else {
                    timers.cancel(&TimerKind::PauseDebounce);
                    self.locks
                        .engage_for(LockKind::EchoSuppress, self.timings.item_load_settle());
                    self.enqueue_unique(item.clone());
                    self.state.switch_item(item);
                    self.last_progress = Some(0.0);
                }
            }
            SyncMessage::QueueAdd { item } => {
                if self.enqueue_unique(item) {
                    self.persist_if_host(&mut effects);
                }
            }
            SyncMessage::RequestItem { item, play_now } => {
                if self.is_host() {
                    let request = ItemRequest {
                        id: generate_id(),
                        item,
                        requested_by: sender,
                        label: sender_label,
                        play_now,
                    };
                    info!(
                        request_id = %request.id,
                        requested_by = %request.requested_by,
                        item_id = %request.item.id,
                        "Item requested"
                    );
                    self.requests.push(request.clone());
                    effects.notices.push(SessionNotice::ItemRequested(request));
                }
            }
            SyncMessage::GrantControl {
                participant,
                granted,
            } => {
                let had_control = self.has_control();
                self.auth.set(participant, granted);
                self.notify_control_change(had_control, &mut effects);
            }
            SyncMessage::ControlListSync { participants } => {
                let had_control = self.has_control();
                self.auth.replace(participants);
                self.notify_control_change(had_control, &mut effects);
            }
            SyncMessage::RequestState => {
                if self.is_host() {
                    effects.broadcast(SyncMessage::StateSnapshot {
                        state: self.snapshot(),
                    });
                    effects.broadcast(SyncMessage::ControlListSync {
                        participants: self.auth.members(),
                    });
                }
            }
            SyncMessage::StateSnapshot { state } => {
                if self.is_host() {
                    debug!(sender = %sender, "Host ignores state snapshots");
                } else {
                    self.hydrate(&state, timers, &mut effects);
                }
            }
            SyncMessage::RequestTime => {
                if self.is_host() && self.state.is_playing {
                    effects.direct(
                        sender,
                        SyncMessage::TimeUpdate {
                            position: self.player.current_time(),
                        },
                    );
                }
            }
            SyncMessage::TimeUpdate { position } => {
                let drift = (self.player.current_time() - position).abs();
                if drift > self.timings.time_update_drift_tolerance_secs {
                    self.locks
                        .engage_for(LockKind::EchoSuppress, self.timings.time_update_settle());
                    self.player.seek_to(position);
                    self.last_progress = Some(position);
                }
                self.state.observe_position(position);
            }
        }

        effects
    }

    fn notify_control_change(&self, had_control: bool, effects: &mut Effects) {
        let granted = self.has_control();
        if granted != had_control {
            info!(participant_id = %self.local.id, granted, "Control privilege changed");
            effects.notices.push(SessionNotice::ControlChanged { granted });
        }
    }

    fn hydrate(&mut self, snapshot: &PlaybackSnapshot, timers: &mut TimerSet, effects: &mut Effects) {
        self.locks.engage(LockKind::Hydration);
        timers.cancel(&TimerKind::PauseDebounce);
        self.state.replace_from(snapshot);

        if snapshot.position > 0.0 {
            let delay = self.timings.hydration_seek_delay();
            self.pending_hydration_seek = Some(snapshot.position);
            timers.schedule(TimerKind::HydrationSeek, self.clock.now() + delay);
            self.locks
                .engage_for(LockKind::EchoSuppress, delay + self.timings.hydration_settle());
        } else {
            self.pending_hydration_seek = None;
            timers.cancel(&TimerKind::HydrationSeek);
        }

        info!(
            position = snapshot.position,
            queue = snapshot.queue.len(),
            is_playing = snapshot.is_playing,
            "Hydrated from host snapshot"
        );
        effects.notices.push(SessionNotice::Hydrated {
            position: snapshot.position,
        });
    }

    /// Hydrate a newly connected peer; only the host does
    pub fn on_peer_connected(&mut self, peer_id: &ParticipantId) -> Effects {
        let mut effects = Effects::default();
        if !self.is_host() {
            return effects;
        }
        let snapshot = self.snapshot();
        debug!(peer_id = %peer_id, position = snapshot.position, "Hydrating peer");
        effects.direct(peer_id.clone(), SyncMessage::StateSnapshot { state: snapshot });
        effects.direct(
            peer_id.clone(),
            SyncMessage::ControlListSync {
                participants: self.auth.members(),
            },
        );
        effects
    }

    // --- local player events ----------------------------------------------

    fn local_suppressed(&self, event: LocalEvent) -> bool {
        match self.locks.suppresses(event) {
            Some(lock) => {
                trace!(event = ?event, lock = lock.as_str(), "Local event suppressed");
                true
            }
            None => false,
        }
    }

    pub fn on_local_play(&mut self, timers: &mut TimerSet) -> Effects {
        let mut effects = Effects::default();
        timers.cancel(&TimerKind::PauseDebounce);
        if self.local_suppressed(LocalEvent::Play) || !self.has_control() || self.state.is_playing {
            return effects;
        }
        let position = self.player.current_time();
        self.state.play();
        self.state.observe_position(position);
        effects.broadcast(SyncMessage::Play { position });
        effects
    }

    /// Start the pause debounce; the pause is only sent if nothing cancels it
    pub fn on_local_pause(&mut self, timers: &mut TimerSet) -> Effects {
        if self.local_suppressed(LocalEvent::Pause) || !self.has_control() || !self.state.is_playing {
            return Effects::default();
        }
        timers.schedule(
            TimerKind::PauseDebounce,
            self.clock.now() + self.timings.pause_debounce(),
        );
        Effects::default()
    }

    fn commit_pause(&mut self) -> Effects {
        let mut effects = Effects::default();
        if self.local_suppressed(LocalEvent::Pause) || !self.has_control() || !self.state.is_playing {
            return effects;
        }
        self.state.pause();
        effects.broadcast(SyncMessage::Pause);
        effects
    }

    pub fn on_local_seek(&mut self, position: f64, timers: &mut TimerSet) -> Effects {
        let mut effects = Effects::default();
        timers.cancel(&TimerKind::PauseDebounce);
        self.last_progress = Some(position);
        if self.local_suppressed(LocalEvent::Seek) || !self.has_control() {
            return effects;
        }
        self.locks.engage(LockKind::Seek);
        self.state.seek(position);
        effects.broadcast(SyncMessage::Seek { position });
        effects
    }

    pub fn on_local_buffer(&mut self) {
        self.locks.engage(LockKind::PauseDebounce);
    }

    /// Progress samples double as seek detection
    pub fn on_local_progress(&mut self, position: f64, timers: &mut TimerSet) -> Effects {
        let previous = self.last_progress.replace(position);
        self.state.observe_position(position);

        let jumped = previous
            .is_some_and(|previous| (position - previous).abs() > self.timings.seek_jump_threshold_secs);
        if jumped && !self.local_suppressed(LocalEvent::ProgressJump) {
            debug!(from = ?previous, to = position, "Progress jump treated as seek");
            return self.on_local_seek(position, timers);
        }
        Effects::default()
    }

    pub fn on_local_ended(&mut self, timers: &mut TimerSet) -> Effects {
        if !self.is_host() {
            return Effects::default();
        }
        self.next(timers).unwrap_or_default()
    }

    // --- user actions --------------------------------------------------------

    /// Play `item` now, or ask the host to
    pub fn select_item(&mut self, item: MediaItem, timers: &mut TimerSet) -> Effects {
        let mut effects = Effects::default();
        if !self.has_control() {
            effects.direct(
                self.host_id(),
                SyncMessage::RequestItem {
                    item,
                    play_now: true,
                },
            );
            return effects;
        }

        if self.state.is_current(&item) {
            if !self.state.is_playing {
                self.state.play();
            }
            effects.broadcast(SyncMessage::PlayItem { item });
            return effects;
        }

        if self.enqueue_unique(item.clone()) {
            effects.broadcast(SyncMessage::QueueAdd { item: item.clone() });
            self.persist_if_host(&mut effects);
        }
        self.switch_locally(item, &mut effects, timers);
        effects
    }

    /// Queue items, or ask the host to
    pub fn add_to_queue(&mut self, items: Vec<MediaItem>, timers: &mut TimerSet) -> Effects {
        let mut effects = Effects::default();
        if !self.has_control() {
            let host = self.host_id();
            for item in items {
                effects.direct(
                    host.clone(),
                    SyncMessage::RequestItem {
                        item,
                        play_now: false,
                    },
                );
            }
            return effects;
        }

        let mut first_added = None;
        for item in items {
            if self.enqueue_unique(item.clone()) {
                first_added.get_or_insert_with(|| item.clone());
                effects.broadcast(SyncMessage::QueueAdd { item });
            }
        }
        if first_added.is_some() {
            self.persist_if_host(&mut effects);
        }
        if let Some(item) = first_added.filter(|_| self.state.current_item.is_none()) {
            self.switch_locally(item, &mut effects, timers);
        }
        effects
    }

    pub fn approve_request(&mut self, request_id: &str, timers: &mut TimerSet) -> Result<Effects> {
        if !self.is_host() {
            return Err(Error::Unauthorized("only the host resolves requests".to_string()));
        }
        let index = self
            .requests
            .iter()
            .position(|r| r.id == request_id)
            .ok_or_else(|| Error::NotFound(format!("request {request_id}")))?;
        let request = self.requests.remove(index);

        let mut effects = Effects::default();
        if self.enqueue_unique(request.item.clone()) {
            effects.broadcast(SyncMessage::QueueAdd {
                item: request.item.clone(),
            });
            self.persist_if_host(&mut effects);
        }
        if request.play_now || self.state.current_item.is_none() {
            self.switch_locally(request.item.clone(), &mut effects, timers);
        }

        info!(
            request_id = %request.id,
            requested_by = %request.requested_by,
            play_now = request.play_now,
            "Request approved"
        );
        Ok(effects)
    }

    pub fn deny_request(&mut self, request_id: &str) -> Result<Effects> {
        if !self.is_host() {
            return Err(Error::Unauthorized("only the host resolves requests".to_string()));
        }
        let before = self.requests.len();
        self.requests.retain(|r| r.id != request_id);
        if self.requests.len() == before {
            return Err(Error::NotFound(format!("request {request_id}")));
        }
        info!(request_id = %request_id, "Request denied");
        Ok(Effects::default())
    }

    pub fn set_control(&mut self, participant: ParticipantId, granted: bool) -> Result<Effects> {
        if !self.is_host() {
            return Err(Error::Unauthorized("only the host grants control".to_string()));
        }
        let mut effects = Effects::default();
        if self.auth.set(participant.clone(), granted) {
            effects.broadcast(SyncMessage::GrantControl {
                participant,
                granted,
            });
        }
        Ok(effects)
    }

    pub fn send_chat(&mut self, text: &str) -> Result<Effects> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput("chat message is empty".to_string()));
        }
        self.record_chat(ChatEntry {
            sender: self.local.id.clone(),
            label: self.local.display_name.clone(),
            text: text.to_string(),
            sent_at: Utc::now(),
        });
        let mut effects = Effects::default();
        effects.broadcast(SyncMessage::Chat {
            text: text.to_string(),
        });
        Ok(effects)
    }

    /// Host: realign everyone. Guest: ask the host to.
    pub fn force_sync(&mut self) -> Effects {
        let mut effects = Effects::default();
        if self.is_host() {
            effects.broadcast(SyncMessage::StateSnapshot {
                state: self.snapshot(),
            });
            effects.broadcast(SyncMessage::ControlListSync {
                participants: self.auth.members(),
            });
        } else {
            effects.direct(self.host_id(), SyncMessage::RequestState);
        }
        effects
    }

    pub fn request_time(&mut self) -> Effects {
        let mut effects = Effects::default();
        if !self.is_host() {
            effects.direct(self.host_id(), SyncMessage::RequestTime);
        }
        effects
    }

    pub fn next(&mut self, timers: &mut TimerSet) -> Result<Effects> {
        if !self.has_control() {
            return Err(Error::Unauthorized("queue navigation requires control".to_string()));
        }
        let mut effects = Effects::default();
        let next = match self.state.current_index() {
            Some(index) => self.state.queue.get(index + 1).cloned(),
            None => self.state.queue.first().cloned(),
        };
        match next {
            Some(item) => self.switch_locally(item, &mut effects, timers),
            None if self.state.is_playing => {
                self.state.pause();
                effects.broadcast(SyncMessage::Pause);
            }
            None => {}
        }
        Ok(effects)
    }

    pub fn previous(&mut self, timers: &mut TimerSet) -> Result<Effects> {
        if !self.has_control() {
            return Err(Error::Unauthorized("queue navigation requires control".to_string()));
        }
        let mut effects = Effects::default();
        match self.state.current_index() {
            Some(index) if index > 0 => {
                let item = self.state.queue[index - 1].clone();
                self.switch_locally(item, &mut effects, timers);
            }
            Some(_) => {
                self.locks.engage(LockKind::Seek);
                self.player.seek_to(0.0);
                self.state.seek(0.0);
                self.last_progress = Some(0.0);
                effects.broadcast(SyncMessage::Seek { position: 0.0 });
            }
            None => {}
        }
        Ok(effects)
    }

    /// A protocol timer fired
    pub fn on_timer(&mut self, kind: &TimerKind) -> Effects {
        match kind {
            TimerKind::PauseDebounce => self.commit_pause(),
            TimerKind::HydrationSeek => {
                if let Some(position) = self.pending_hydration_seek.take() {
                    self.locks
                        .engage_for(LockKind::EchoSuppress, self.timings.hydration_settle());
                    self.player.seek_to(position);
                    self.state.observe_position(position);
                    self.last_progress = Some(position);
                    debug!(position, "Applied hydration seek");
                }
                Effects::default()
            }
            TimerKind::Reconnect(_) => Effects::default(),
        }
    }

    /// Forget every lock and pending action
    pub fn reset_transient(&mut self) {
        self.locks.clear();
        self.pending_hydration_seek = None;
        self.last_progress = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::player::VirtualPlayer;
    use std::time::Duration;

    struct Harness {
        clock: ManualClock,
        player: VirtualPlayer,
        protocol: SyncProtocol,
        timers: TimerSet,
    }

    fn harness(local: &str, host: &str, seed: &[&str], queue: Vec<MediaItem>) -> Harness {
        let clock = ManualClock::new();
        let player = VirtualPlayer::new();
        let session = StoredSession {
            host_id: ParticipantId::from(host),
            queue,
            authorization_seed: seed.iter().map(|id| ParticipantId::from(*id)).collect(),
        };
        let protocol = SyncProtocol::new(
            Participant::new(local, local.to_uppercase()),
            &session,
            SyncTimings::default(),
            Arc::new(clock.clone()),
            Box::new(player.clone()),
        );
        Harness {
            clock,
            player,
            protocol,
            timers: TimerSet::new(),
        }
    }

    fn frame(sender: &str, message: SyncMessage) -> Frame {
        Frame {
            sender: ParticipantId::from(sender),
            sender_label: sender.to_uppercase(),
            target: None,
            message,
        }
    }

    impl Harness {
        fn receive(&mut self, sender: &str, message: SyncMessage) -> Effects {
            self.protocol
                .handle_frame(&ParticipantId::from(sender), frame(sender, message), &mut self.timers)
        }

        /// Fire every due timer and collect the messages they produce
        fn advance(&mut self, by: Duration) -> Vec<SyncMessage> {
            self.clock.advance(by);
            let mut sent = Vec::new();
            for kind in self.timers.take_due(self.clock.now()) {
                sent.extend(self.protocol.on_timer(&kind).outbound.into_iter().map(|o| o.message));
            }
            sent
        }
    }

    fn messages(effects: &Effects) -> Vec<&SyncMessage> {
        effects.outbound.iter().map(|o| &o.message).collect()
    }

    fn item(id: &str) -> MediaItem {
        MediaItem::new(id, format!("Song {id}"))
    }

    #[test]
    fn test_host_drops_unauthorized_control() {
        let mut h = harness("h", "h", &["a"], vec![item("1")]);
        let before = h.protocol.state().clone();

        let effects = h.receive("b", SyncMessage::Play { position: 10.0 });
        assert!(effects.is_empty());
        assert_eq!(h.protocol.state(), &before);

        h.receive("a", SyncMessage::Play { position: 10.0 });
        assert!(h.protocol.state().is_playing);
    }

    #[test]
    fn test_link_identity_wins_over_claimed_sender() {
        let mut h = harness("h", "h", &[], vec![]);
        let spoofed = frame("h", SyncMessage::Pause);
        h.protocol.state.is_playing = true;

        h.protocol
            .handle_frame(&ParticipantId::from("b"), spoofed, &mut h.timers);
        assert!(h.protocol.state().is_playing);
    }

    #[test]
    fn test_host_never_self_hydrates() {
        let mut h = harness("h", "h", &["a"], vec![item("1")]);
        let before = h.protocol.state().clone();
        let bogus = PlaybackSnapshot {
            media_url: "x".to_string(),
            is_playing: true,
            queue: vec![],
            current_item: None,
            position: 99.0,
        };

        h.receive("a", SyncMessage::StateSnapshot { state: bogus });
        assert_eq!(h.protocol.state(), &before);
        assert!(h.timers.is_empty());
    }

    #[test]
    fn test_guest_ignores_host_only_messages_from_guests() {
        let mut h = harness("g", "h", &[], vec![]);
        h.receive("x", SyncMessage::GrantControl {
            participant: ParticipantId::from("g"),
            granted: true,
        });
        assert!(!h.protocol.has_control());

        let effects = h.receive("h", SyncMessage::GrantControl {
            participant: ParticipantId::from("g"),
            granted: true,
        });
        assert!(h.protocol.has_control());
        assert_eq!(effects.notices, vec![SessionNotice::ControlChanged { granted: true }]);
    }

    #[test]
    fn test_hydration_seeks_and_suppresses_echo() {
        let mut h = harness("g", "h", &["g"], vec![]);
        let snapshot = PlaybackSnapshot {
            media_url: item("1").media_url(),
            is_playing: true,
            queue: vec![item("1")],
            current_item: Some(item("1")),
            position: 42.0,
        };

        let effects = h.receive("h", SyncMessage::StateSnapshot { state: snapshot });
        assert_eq!(effects.notices, vec![SessionNotice::Hydrated { position: 42.0 }]);
        assert_eq!(h.protocol.state().queue, vec![item("1")]);
        assert!(h.player.seeks().is_empty(), "seek is deferred");

        assert!(h.advance(Duration::from_millis(1000)).is_empty());
        assert_eq!(h.player.seeks(), vec![42.0]);

        // Player churn caused by the seek stays local
        assert!(h.protocol.on_local_pause(&mut h.timers).is_empty());
        assert!(h.protocol.on_local_play(&mut h.timers).is_empty());
        assert!(h.advance(Duration::from_millis(1500)).is_empty());

        h.advance(Duration::from_millis(2000));
        assert!(!h.protocol.is_locked(LockKind::EchoSuppress));
        h.protocol.on_local_pause(&mut h.timers);
        assert_eq!(h.advance(Duration::from_millis(1000)), vec![SyncMessage::Pause]);
    }

    #[test]
    fn test_seek_cancels_pending_pause() {
        let mut h = harness("h", "h", &[], vec![item("1")]);
        h.protocol.select_item(item("1"), &mut h.timers);

        h.protocol.on_local_pause(&mut h.timers);
        assert!(h.timers.is_pending(&TimerKind::PauseDebounce));
        h.clock.advance(Duration::from_millis(400));

        let effects = h.protocol.on_local_seek(30.0, &mut h.timers);
        assert_eq!(messages(&effects), vec![&SyncMessage::Seek { position: 30.0 }]);
        assert!(!h.timers.is_pending(&TimerKind::PauseDebounce));
        assert!(h.advance(Duration::from_secs(5)).is_empty());
        assert!(h.protocol.state().is_playing);
    }

    #[test]
    fn test_pause_during_buffering_is_not_sent() {
        let mut h = harness("h", "h", &[], vec![item("1")]);
        h.protocol.select_item(item("1"), &mut h.timers);

        h.protocol.on_local_buffer();
        h.protocol.on_local_pause(&mut h.timers);
        assert!(h.timers.is_empty());

        h.clock.advance(Duration::from_millis(1500));
        h.protocol.on_local_pause(&mut h.timers);
        assert_eq!(h.advance(Duration::from_millis(1000)), vec![SyncMessage::Pause]);
        assert!(!h.protocol.state().is_playing);
    }

    #[test]
    fn test_play_item_for_current_item_is_idempotent() {
        let mut h = harness("g", "h", &[], vec![]);
        h.receive("h", SyncMessage::PlayItem { item: item("1") });
        h.receive("h", SyncMessage::TimeUpdate { position: 37.0 });
        assert_eq!(h.protocol.state().position, 37.0);

        h.receive("h", SyncMessage::PlayItem { item: item("1") });
        h.receive("h", SyncMessage::PlayItem { item: item("1") });
        assert_eq!(h.protocol.state().position, 37.0);
        assert_eq!(h.protocol.state().queue.len(), 1);
    }

    #[test]
    fn test_request_approval_flow() {
        let mut guest = harness("g", "h", &[], vec![]);
        let effects = guest.protocol.select_item(item("2"), &mut guest.timers);
        assert_eq!(effects.outbound.len(), 1);
        assert_eq!(effects.outbound[0].target, Some(ParticipantId::from("h")));
        assert!(guest.protocol.state().current_item.is_none());

        let mut host = harness("h", "h", &[], vec![item("1")]);
        let request = effects.outbound[0].message.clone();
        let effects = host.receive("g", request);
        let SessionNotice::ItemRequested(pending) = &effects.notices[0] else {
            panic!("expected a request notice");
        };
        assert_eq!(host.protocol.pending_requests().len(), 1);

        let effects = host.protocol.approve_request(&pending.id, &mut host.timers).unwrap();
        assert_eq!(
            messages(&effects),
            vec![
                &SyncMessage::QueueAdd { item: item("2") },
                &SyncMessage::PlayItem { item: item("2") },
            ]
        );
        assert_eq!(effects.persist_queue, Some(vec![item("1"), item("2")]));
        assert!(host.protocol.pending_requests().is_empty());
        assert!(matches!(
            host.protocol.approve_request(&pending.id, &mut host.timers),
            Err(Error::NotFound(_))
        ));

        for message in effects.outbound.into_iter().map(|o| o.message) {
            guest.receive("h", message);
        }
        assert_eq!(guest.protocol.state().current_item, Some(item("2")));
    }

    #[test]
    fn test_approved_queue_request_keeps_paused_item() {
        let mut host = harness("h", "h", &[], vec![item("1")]);
        host.protocol.select_item(item("1"), &mut host.timers);
        host.protocol.on_local_seek(50.0, &mut host.timers);
        host.protocol.state.pause();

        let mut guest = harness("g", "h", &[], vec![item("1")]);
        let effects = guest.protocol.add_to_queue(vec![item("2")], &mut guest.timers);
        for message in effects.outbound.into_iter().map(|o| o.message) {
            host.receive("g", message);
        }
        let request_id = host.protocol.pending_requests()[0].id.clone();
        assert!(!host.protocol.pending_requests()[0].play_now);

        let effects = host.protocol.approve_request(&request_id, &mut host.timers).unwrap();
        assert_eq!(messages(&effects), vec![&SyncMessage::QueueAdd { item: item("2") }]);
        assert_eq!(host.protocol.state().current_item, Some(item("1")));
        assert_eq!(host.protocol.state().position, 50.0);
        assert!(!host.protocol.state().is_playing);
        assert_eq!(host.protocol.state().queue, vec![item("1"), item("2")]);
    }

    #[test]
    fn test_guest_queue_add_is_not_persisted() {
        let mut h = harness("g", "h", &[], vec![]);
        let effects = h.receive("h", SyncMessage::QueueAdd { item: item("1") });
        assert!(effects.persist_queue.is_none());

        let mut host = harness("h", "h", &["a"], vec![]);
        let effects = host.receive("a", SyncMessage::QueueAdd { item: item("1") });
        assert_eq!(effects.persist_queue, Some(vec![item("1")]));
        let effects = host.receive("a", SyncMessage::QueueAdd { item: item("1") });
        assert!(effects.persist_queue.is_none(), "duplicate delivery is ignored");
    }

    #[test]
    fn test_progress_jump_becomes_seek() {
        let mut h = harness("h", "h", &[], vec![item("1")]);
        h.protocol.select_item(item("1"), &mut h.timers);

        assert!(h.protocol.on_local_progress(1.0, &mut h.timers).is_empty());
        let effects = h.protocol.on_local_progress(60.0, &mut h.timers);
        assert_eq!(messages(&effects), vec![&SyncMessage::Seek { position: 60.0 }]);

        // Inside the seek lock further jumps stay local
        assert!(h.protocol.on_local_progress(90.0, &mut h.timers).is_empty());
    }

    #[test]
    fn test_queue_navigation() {
        let mut h = harness("h", "h", &[], vec![item("1"), item("2")]);
        let effects = h.protocol.next(&mut h.timers).unwrap();
        assert_eq!(messages(&effects), vec![&SyncMessage::PlayItem { item: item("1") }]);

        h.protocol.next(&mut h.timers).unwrap();
        assert_eq!(h.protocol.state().current_item, Some(item("2")));

        let effects = h.protocol.on_local_ended(&mut h.timers);
        assert_eq!(messages(&effects), vec![&SyncMessage::Pause]);

        h.protocol.previous(&mut h.timers).unwrap();
        assert_eq!(h.protocol.state().current_item, Some(item("1")));
        let effects = h.protocol.previous(&mut h.timers).unwrap();
        assert_eq!(messages(&effects), vec![&SyncMessage::Seek { position: 0.0 }]);

        let mut guest = harness("g", "h", &[], vec![item("1")]);
        assert!(matches!(guest.protocol.next(&mut guest.timers), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_hydration_of_new_peer_is_direct() {
        let mut h = harness("h", "h", &["a"], vec![item("1")]);
        h.protocol.select_item(item("1"), &mut h.timers);
        h.player.set_time(42.0);

        let effects = h.protocol.on_peer_connected(&ParticipantId::from("g"));
        assert_eq!(effects.outbound.len(), 2);
        assert!(effects
            .outbound
            .iter()
            .all(|o| o.target == Some(ParticipantId::from("g"))));
        match &effects.outbound[0].message {
            SyncMessage::StateSnapshot { state } => {
                assert_eq!(state.position, 42.0);
                assert_eq!(state.current_item, Some(item("1")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            effects.outbound[1].message,
            SyncMessage::ControlListSync {
                participants: vec![ParticipantId::from("a")]
            }
        );

        let mut guest = harness("g", "h", &[], vec![]);
        assert!(guest.protocol.on_peer_connected(&ParticipantId::from("x")).is_empty());
    }

    #[test]
    fn test_request_time_answered_only_by_playing_host() {
        let mut h = harness("h", "h", &[], vec![item("1")]);
        assert!(h.receive("g", SyncMessage::RequestTime).is_empty());

        h.protocol.select_item(item("1"), &mut h.timers);
        h.player.set_time(12.0);
        let effects = h.receive("g", SyncMessage::RequestTime);
        assert_eq!(effects.outbound[0].target, Some(ParticipantId::from("g")));
        assert_eq!(effects.outbound[0].message, SyncMessage::TimeUpdate { position: 12.0 });
    }

    #[test]
    fn test_chat_log_is_bounded() {
        let mut h = harness("h", "h", &[], vec![]);
        h.protocol.timings.chat_history = 2;
        for n in 0..3 {
            h.receive("g", SyncMessage::Chat { text: format!("m{n}") });
        }
        let texts: Vec<&str> = h.protocol.chat_log().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["m1", "m2"]);
        assert!(h.protocol.send_chat("   ").is_err());
    }
}
