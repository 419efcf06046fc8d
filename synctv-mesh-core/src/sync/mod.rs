//! Playback synchronization over the mesh

pub mod authorization;
pub mod lock;
pub mod messages;
pub mod protocol;
pub mod timers;

pub use authorization::AuthorizationSet;
pub use lock::{LocalEvent, LockDurations, LockKind, LockState, PlaybackLockController};
pub use messages::{Frame, Outbound, SyncMessage};
pub use protocol::{ChatEntry, Effects, ItemRequest, SessionNotice, SyncProtocol};
pub use timers::{TimerKind, TimerSet};
