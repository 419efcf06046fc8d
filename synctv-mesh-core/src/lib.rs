//! `SyncTV` peer mesh synchronization engine
//!
//! Keeps several clients of one room playing the same media in lockstep
//! without a central arbiter. Every client joins a shared presence channel,
//! opens a direct link to every other participant, and exchanges playback
//! control messages over that full mesh.
//!
//! ## Architecture
//!
//! - **`PresenceDirectory`**: live membership of the room
//! - **`SignalingRelay`**: handshake envelopes routed over the presence channel
//! - **`MeshManager`**: one direct link per remote participant, deterministic
//!   initiator selection, reconnect with a fixed delay
//! - **`PlaybackLockController`**: named, time-bounded locks that keep player
//!   side effects of remote commands from being re-broadcast
//! - **`SyncProtocol`**: message taxonomy, host authorization gate, hydration
//!   of newcomers, local event to message mapping
//! - **`SessionEngine`**: the single task that owns all of the above
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_mesh_core::{Config, SessionEngine, SessionParts};
//!
//! let handle = SessionEngine::start(&config, parts).await?;
//! handle.select_item(item)?;
//! handle.leave().await?;
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod player;
pub mod service;
pub mod sync;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::{
    PeerSummary, PlayerEvent, SessionCommand, SessionEngine, SessionHandle, SessionParts,
    SessionView,
};
pub use error::{Error, Result};
pub use models::{
    MediaItem, Participant, ParticipantId, PlaybackState, PresenceRecord, PresenceSnapshot, RoomId,
};
pub use player::{PlayerControl, VirtualPlayer};
pub use service::{MeshEvent, MeshManager, PresenceDirectory, SignalingRelay};
pub use sync::{
    AuthorizationSet, LockKind, PlaybackLockController, SessionNotice, SyncMessage, SyncProtocol,
};
