use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use synctv_mesh_core::{
    logging,
    service::{MemorySessionStore, StoredSession},
    transport::{MemoryPeerNetwork, MemoryRoomHub},
    Config, MediaItem, Participant, ParticipantId, PlayerEvent, RoomId, SessionEngine,
    SessionHandle, SessionNotice, SessionParts, VirtualPlayer,
};

/// Run a watch-together room over the in-process mesh
#[derive(Debug, Parser)]
#[command(name = "synctv-mesh", version)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "SYNCTV_MESH_CONFIG_PATH")]
    config: Option<String>,

    /// Number of guests joining after the host
    #[arg(short, long, default_value_t = 2)]
    guests: usize,

    /// Room identifier
    #[arg(short, long, default_value = "demo-room")]
    room: String,

    /// Seconds to let the room settle before printing views
    #[arg(long, default_value_t = 3)]
    settle_secs: u64,
}

struct Member {
    handle: SessionHandle,
    player: VirtualPlayer,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let path = path.map_or_else(
        || {
            let local = std::path::Path::new("synctv-mesh.yaml");
            local.exists().then(|| local.to_string_lossy().into_owned())
        },
        |p| Some(p.to_string()),
    );
    Config::load(path.as_deref()).context("failed to load configuration")
}

fn demo_queue() -> Vec<MediaItem> {
    vec![
        MediaItem::new("big-buck-bunny", "Big Buck Bunny"),
        MediaItem::new("sintel", "Sintel"),
        MediaItem::new("tears-of-steel", "Tears of Steel"),
    ]
}

async fn join(
    config: &Config,
    room_id: &RoomId,
    hub: &MemoryRoomHub,
    network: &MemoryPeerNetwork,
    store: &MemorySessionStore,
    id: &str,
    display_name: &str,
) -> Result<Member> {
    let player = VirtualPlayer::new();
    let parts = SessionParts {
        room_id: room_id.clone(),
        identity: Participant::new(id, display_name),
        transport: Arc::new(hub.clone()),
        connector: network.connector(ParticipantId::from(id)),
        player: Box::new(player.clone()),
        store: Arc::new(store.clone()),
    };
    let handle = SessionEngine::start(config, parts)
        .await
        .with_context(|| format!("failed to start session for {id}"))?;
    info!(participant = %id, "Joined room");
    Ok(Member { handle, player })
}

/// Approve every item request the host sees
fn spawn_auto_approver(host: SessionHandle, mut notices: broadcast::Receiver<SessionNotice>) {
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(SessionNotice::ItemRequested(request)) => {
                    info!(
                        request_id = %request.id,
                        requested_by = %request.requested_by,
                        item = %request.item.title,
                        "Approving item request"
                    );
                    if host.approve_request(request.id).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notice receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!("{} configuration error(s)", errors.len());
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(room = %args.room, guests = args.guests, "Starting synctv-mesh");

    // 4. In-process room infrastructure
    let room_id = RoomId::from(args.room.as_str());
    let hub = MemoryRoomHub::new();
    let network = MemoryPeerNetwork::new();
    let store = MemorySessionStore::new();
    let host_id = ParticipantId::from("host");
    store.insert(
        room_id.clone(),
        StoredSession {
            host_id: host_id.clone(),
            queue: demo_queue(),
            authorization_seed: Vec::new(),
        },
    );

    // 5. Host starts the first item, guests join afterwards and hydrate
    let host = join(&config, &room_id, &hub, &network, &store, "host", "Host").await?;
    spawn_auto_approver(host.handle.clone(), host.handle.notices());
    if let Some(first) = demo_queue().into_iter().next() {
        host.handle.select_item(first)?;
    }
    host.player.set_time(12.5);

    let mut guests = Vec::with_capacity(args.guests);
    for n in 1..=args.guests {
        let id = format!("guest-{n}");
        let name = format!("Guest {n}");
        guests.push(join(&config, &room_id, &hub, &network, &store, &id, &name).await?);
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    // 6. Exercise the protocol: a request, a control grant and chat
    if let Some(first_guest) = guests.first() {
        first_guest
            .handle
            .select_item(MediaItem::new("cosmos-laundromat", "Cosmos Laundromat"))?;
        host.handle.set_control(first_guest.handle.local_id().clone(), true)?;
        first_guest.handle.send_chat("hello from the mesh")?;
    }

    tokio::time::sleep(Duration::from_secs(args.settle_secs)).await;

    if let Some(first_guest) = guests.first() {
        first_guest.player.set_time(64.0);
        first_guest.handle.player_event(PlayerEvent::Seek(64.0))?;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    // 7. Report what every participant ended up with
    for member in std::iter::once(&host).chain(guests.iter()) {
        let view = member.handle.view();
        info!(
            participant = %view.local_id,
            connected = view.connected_peers().len(),
            position = view.playback.position,
            "Session converged"
        );
        println!("{}", serde_json::to_string_pretty(&view)?);
    }

    // 8. Leave
    for member in guests.iter().chain(std::iter::once(&host)) {
        if let Err(e) = member.handle.leave().await {
            error!(participant = %member.handle.local_id(), error = %e, "Leave failed");
        }
    }
    info!("Room closed");

    Ok(())
}
