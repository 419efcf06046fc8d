//! Playback lock controller
//!
//! Applying a remote command makes the local player raise its own
//! play/pause/seek/buffer events. Those must not be re-broadcast, so every
//! remote-originated change engages one or more named locks, and local
//! event handlers consult them before emitting anything.
//!
//! Locks are released purely by elapsed time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockKind {
    /// Newcomer is applying a state snapshot
    Hydration,
    /// A remote command is settling on the local player
    EchoSuppress,
    /// A seek is settling (buffering, stray play/pause)
    Seek,
    /// The player is buffering; pauses are not real pauses
    PauseDebounce,
}

impl LockKind {
    pub const ALL: [Self; 4] = [
        Self::Hydration,
        Self::EchoSuppress,
        Self::Seek,
        Self::PauseDebounce,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hydration => "hydration",
            Self::EchoSuppress => "echo-suppress",
            Self::Seek => "seek",
            Self::PauseDebounce => "pause-debounce",
        }
    }
}

/// Local player events that may turn into outgoing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEvent {
    Play,
    Pause,
    Seek,
    /// A progress sample far from the previous one
    ProgressJump,
}

impl LocalEvent {
    /// Locks under which this event must stay local
    #[must_use]
    pub const fn blocked_by(&self) -> &'static [LockKind] {
        match self {
            Self::Play | Self::Seek => &[LockKind::Hydration, LockKind::EchoSuppress],
            Self::Pause => &LockKind::ALL,
            Self::ProgressJump => &[LockKind::Hydration, LockKind::EchoSuppress, LockKind::Seek],
        }
    }
}

/// Default window per lock kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockDurations {
    pub hydration: Duration,
    pub echo_suppress: Duration,
    pub seek: Duration,
    pub pause_debounce: Duration,
}

impl Default for LockDurations {
    fn default() -> Self {
        Self {
            hydration: Duration::from_millis(2000),
            echo_suppress: Duration::from_millis(1000),
            seek: Duration::from_millis(2000),
            pause_debounce: Duration::from_millis(1500),
        }
    }
}

impl LockDurations {
    #[must_use]
    pub const fn of(&self, kind: LockKind) -> Duration {
        match kind {
            LockKind::Hydration => self.hydration,
            LockKind::EchoSuppress => self.echo_suppress,
            LockKind::Seek => self.seek,
            LockKind::PauseDebounce => self.pause_debounce,
        }
    }
}

/// An active lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockState {
    pub kind: LockKind,
    #[serde(skip)]
    pub expires_at: Instant,
}

pub struct PlaybackLockController {
    clock: Arc<dyn Clock>,
    durations: LockDurations,
    expiries: HashMap<LockKind, Instant>,
}

impl std::fmt::Debug for PlaybackLockController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackLockController")
            .field("durations", &self.durations)
            .field("expiries", &self.expiries)
            .finish_non_exhaustive()
    }
}

impl PlaybackLockController {
    pub fn new(clock: Arc<dyn Clock>, durations: LockDurations) -> Self {
        Self {
            clock,
            durations,
            expiries: HashMap::new(),
        }
    }

    /// Engage `kind` for its default window
    pub fn engage(&mut self, kind: LockKind) -> Instant {
        self.engage_for(kind, self.durations.of(kind))
    }

    /// Engage `kind` for `window`; an already longer lock is kept
    pub fn engage_for(&mut self, kind: LockKind, window: Duration) -> Instant {
        let candidate = self.clock.now() + window;
        let expires_at = self
            .expiries
            .get(&kind)
            .map_or(candidate, |current| (*current).max(candidate));
        self.expiries.insert(kind, expires_at);
        tracing::trace!(lock = kind.as_str(), window_ms = window.as_millis() as u64, "Lock engaged");
        expires_at
    }

    #[must_use]
    pub fn is_active(&self, kind: LockKind) -> bool {
        self.expiries
            .get(&kind)
            .is_some_and(|expires_at| *expires_at > self.clock.now())
    }

    /// The first active lock that keeps `event` from being broadcast
    #[must_use]
    pub fn suppresses(&self, event: LocalEvent) -> Option<LockKind> {
        event
            .blocked_by()
            .iter()
            .copied()
            .find(|kind| self.is_active(*kind))
    }

    #[must_use]
    pub fn expires_at(&self, kind: LockKind) -> Option<Instant> {
        self.expiries
            .get(&kind)
            .copied()
            .filter(|expires_at| *expires_at > self.clock.now())
    }

    /// Every lock still active, in kind order
    #[must_use]
    pub fn locks(&self) -> Vec<LockState> {
        LockKind::ALL
            .iter()
            .filter_map(|kind| {
                self.expires_at(*kind).map(|expires_at| LockState {
                    kind: *kind,
                    expires_at,
                })
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.expiries.clear();
    }
}
