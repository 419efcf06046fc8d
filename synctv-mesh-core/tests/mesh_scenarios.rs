//! End-to-end sessions over the in-memory transports, on paused time

use std::sync::Arc;
use std::time::Duration;

use synctv_mesh_core::service::webrtc::PeerConnectionState;
use synctv_mesh_core::service::{MemorySessionStore, StoredSession};
use synctv_mesh_core::transport::{MemoryPeerNetwork, MemoryRoomHub};
use synctv_mesh_core::{
    Config, MediaItem, Participant, ParticipantId, PlayerEvent, RoomId, SessionEngine,
    SessionHandle, SessionNotice, SessionParts, VirtualPlayer,
};
use tokio::sync::broadcast;

struct TestRoom {
    hub: MemoryRoomHub,
    network: MemoryPeerNetwork,
    store: MemorySessionStore,
    room_id: RoomId,
    config: Config,
}

impl TestRoom {
    fn new(host: &str, seed: &[&str], queue: Vec<MediaItem>) -> Self {
        let store = MemorySessionStore::new();
        let room_id = RoomId::from("movie-night");
        store.insert(
            room_id.clone(),
            StoredSession {
                host_id: ParticipantId::from(host),
                queue,
                authorization_seed: seed.iter().map(|id| ParticipantId::from(*id)).collect(),
            },
        );
        Self {
            hub: MemoryRoomHub::new(),
            network: MemoryPeerNetwork::new(),
            store,
            room_id,
            config: Config::default(),
        }
    }

    async fn join(&self, id: &str) -> (SessionHandle, VirtualPlayer) {
        let player = VirtualPlayer::new();
        let parts = SessionParts {
            room_id: self.room_id.clone(),
            identity: Participant::new(id, id.to_uppercase()),
            transport: Arc::new(self.hub.clone()),
            connector: self.network.connector(ParticipantId::from(id)),
            player: Box::new(player.clone()),
            store: Arc::new(self.store.clone()),
        };
        let handle = SessionEngine::start(&self.config, parts).await.unwrap();
        (handle, player)
    }
}

fn item(id: &str) -> MediaItem {
    MediaItem::new(id, format!("Track {id}"))
}

fn pid(id: &str) -> ParticipantId {
    ParticipantId::from(id)
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn drain(notices: &mut broadcast::Receiver<SessionNotice>) -> Vec<SessionNotice> {
    let mut received = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        received.push(notice);
    }
    received
}

#[tokio::test(start_paused = true)]
async fn test_guest_hydrates_to_host_position_without_echo() {
    let room = TestRoom::new("h", &["g"], vec![item("1")]);
    let (host, host_player) = room.join("h").await;
    host.select_item(item("1")).unwrap();
    settle(10).await;
    host_player.set_time(42.0);

    let (guest, guest_player) = room.join("g").await;
    let mut notices = guest.notices();
    settle(100).await;

    let view = guest.view();
    assert_eq!(view.connected_peers(), vec![pid("h")]);
    assert_eq!(view.playback.current_item, Some(item("1")));
    assert_eq!(view.playback.queue, vec![item("1")]);
    assert!(view.playback.is_playing);
    assert!(drain(&mut notices).contains(&SessionNotice::Hydrated { position: 42.0 }));
    assert!(guest_player.seeks().is_empty(), "hydration seek is deferred");

    settle(1000).await;
    assert_eq!(guest_player.seeks(), vec![42.0]);

    // The seek makes the player pause and resume; none of it reaches the host
    guest.player_event(PlayerEvent::Buffer).unwrap();
    guest.player_event(PlayerEvent::Pause).unwrap();
    guest.player_event(PlayerEvent::Play).unwrap();
    settle(1500).await;
    assert!(host.view().playback.is_playing);

    // Once settled, a real pause from the authorized guest goes through
    settle(2000).await;
    guest.player_event(PlayerEvent::Pause).unwrap();
    settle(1500).await;
    assert!(!host.view().playback.is_playing);
}

#[tokio::test(start_paused = true)]
async fn test_unprivileged_selection_becomes_request() {
    let room = TestRoom::new("h", &[], vec![item("1")]);
    let (host, _host_player) = room.join("h").await;
    let mut host_notices = host.notices();
    host.select_item(item("1")).unwrap();

    let (guest, _guest_player) = room.join("g").await;
    settle(100).await;
    assert!(!guest.view().has_control);

    guest.select_item(item("2")).unwrap();
    settle(50).await;
    assert_eq!(guest.view().playback.current_item, Some(item("1")));

    let request = drain(&mut host_notices)
        .into_iter()
        .find_map(|notice| match notice {
            SessionNotice::ItemRequested(request) => Some(request),
            _ => None,
        })
        .unwrap();
    assert_eq!(request.requested_by, pid("g"));
    assert!(request.play_now);
    assert_eq!(host.view().pending_requests.len(), 1);

    host.approve_request(request.id).unwrap();
    settle(50).await;

    assert!(host.view().pending_requests.is_empty());
    assert_eq!(guest.view().playback.current_item, Some(item("2")));
    assert_eq!(guest.view().playback.queue, vec![item("1"), item("2")]);
    assert_eq!(room.store.queue(&room.room_id), Some(vec![item("1"), item("2")]));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_link_is_retried_once_by_initiator() {
    let room = TestRoom::new("h", &[], vec![]);
    let (host, _) = room.join("h").await;
    let (guest, _) = room.join("g").await;
    settle(100).await;
    assert_eq!(host.view().peer_state(&pid("g")), PeerConnectionState::Connected);

    room.network.sever(&pid("h"), &pid("g"));
    settle(10).await;
    assert_eq!(host.view().peer_state(&pid("g")), PeerConnectionState::Reconnecting);
    assert_eq!(guest.view().peer_state(&pid("h")), PeerConnectionState::Absent);

    settle(3000).await;
    assert_eq!(host.view().peer_state(&pid("g")), PeerConnectionState::Connected);
    assert_eq!(guest.view().peer_state(&pid("h")), PeerConnectionState::Connected);
    assert_eq!(host.view().mesh.reconnects_scheduled, 1);
    assert_eq!(host.view().mesh.links, 1);
    assert_eq!(room.network.endpoint_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_three_way_mesh_converges_and_shrinks() {
    let room = TestRoom::new("a", &[], vec![]);
    let (a, _) = room.join("a").await;
    let (b, _) = room.join("b").await;
    let (c, _) = room.join("c").await;
    settle(100).await;

    for (handle, others) in [(&a, ["b", "c"]), (&b, ["a", "c"]), (&c, ["a", "b"])] {
        assert_eq!(handle.view().connected_peers(), vec![pid(others[0]), pid(others[1])]);
    }
    assert_eq!(c.view().mesh.initiated, 2);
    assert_eq!(b.view().mesh.initiated, 1);
    assert_eq!(a.view().mesh.initiated, 0);

    b.leave().await.unwrap();
    settle(3500).await;

    assert_eq!(a.view().connected_peers(), vec![pid("c")]);
    assert_eq!(c.view().connected_peers(), vec![pid("a")]);
    assert_eq!(c.view().peer_state(&pid("b")), PeerConnectionState::Absent);
    assert_eq!(c.view().mesh.links, 1);
    assert!(b.view().closed);
    assert!(b.force_sync().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_granted_guest_controls_playback() {
    let room = TestRoom::new("h", &[], vec![item("1")]);
    let (host, host_player) = room.join("h").await;
    host.select_item(item("1")).unwrap();
    let (guest, _) = room.join("g").await;
    let mut guest_notices = guest.notices();
    settle(5000).await;

    // Ignored until control is granted
    guest.player_event(PlayerEvent::Seek(30.0)).unwrap();
    settle(50).await;
    assert!(host_player.seeks().is_empty());

    host.set_control(pid("g"), true).unwrap();
    settle(50).await;
    assert!(guest.view().has_control);
    assert!(drain(&mut guest_notices).contains(&SessionNotice::ControlChanged { granted: true }));

    guest.player_event(PlayerEvent::Seek(30.0)).unwrap();
    settle(50).await;
    assert_eq!(host_player.seeks(), vec![30.0]);
    assert_eq!(host.view().playback.position, 30.0);

    guest.send_chat("nice track").unwrap();
    settle(50).await;
    let chat = host.view().chat;
    assert_eq!(chat.len(), 1);
    assert_eq!(chat[0].label, "G");

    guest.force_sync().unwrap();
    settle(50).await;
    assert!(drain(&mut guest_notices)
        .iter()
        .any(|n| matches!(n, SessionNotice::Hydrated { .. })));
}
