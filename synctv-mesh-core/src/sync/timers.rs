//! Pending deadlines owned by the session task
//!
//! Each timer kind holds at most one deadline; scheduling again replaces it.
//! The session loop sleeps until `next_deadline` and then drains `take_due`.

use std::collections::HashMap;
use std::time::Instant;

use crate::models::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Retry the link to a peer after an unexpected close
    Reconnect(ParticipantId),
    /// Commit a locally observed pause
    PauseDebounce,
    /// Apply the position received in a state snapshot
    HydrationSeek,
}

#[derive(Debug, Default)]
pub struct TimerSet {
    deadlines: HashMap<TimerKind, Instant>,
}

impl TimerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines.insert(kind, at);
    }

    /// Returns whether a pending timer was removed
    pub fn cancel(&mut self, kind: &TimerKind) -> bool {
        self.deadlines.remove(kind).is_some()
    }

    #[must_use]
    pub fn is_pending(&self, kind: &TimerKind) -> bool {
        self.deadlines.contains_key(kind)
    }

    #[must_use]
    pub fn deadline(&self, kind: &TimerKind) -> Option<Instant> {
        self.deadlines.get(kind).copied()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(kind, at)| (*at, kind.clone()))
            .collect();
        due.sort();

        for (_, kind) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}
