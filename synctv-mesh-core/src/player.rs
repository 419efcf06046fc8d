//! Player control surface
//!
//! The engine drives the media player through `PlayerControl` and learns
//! about what the player did through `PlayerEvent`s fed into the session.

use parking_lot::Mutex;
use std::sync::Arc;

pub trait PlayerControl: Send {
    fn seek_to(&mut self, seconds: f64);

    fn current_time(&self) -> f64;
}

#[derive(Debug, Default)]
struct VirtualPlayerState {
    time: f64,
    seeks: Vec<f64>,
}

/// Headless player: keeps a clock the caller moves, and records every seek
///
/// Clones share state, so a test or the demo can hold one clone while the
/// session owns another.
#[derive(Debug, Clone, Default)]
pub struct VirtualPlayer {
    state: Arc<Mutex<VirtualPlayerState>>,
}

impl VirtualPlayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn at(seconds: f64) -> Self {
        let player = Self::new();
        player.set_time(seconds);
        player
    }

    pub fn set_time(&self, seconds: f64) {
        self.state.lock().time = seconds;
    }

    /// Every position passed to `seek_to`, oldest first
    #[must_use]
    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().seeks.clone()
    }
}

impl PlayerControl for VirtualPlayer {
    fn seek_to(&mut self, seconds: f64) {
        let mut state = self.state.lock();
        state.time = seconds;
        state.seeks.push(seconds);
    }

    fn current_time(&self) -> f64 {
        self.state.lock().time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let observer = VirtualPlayer::at(3.0);
        let mut owned: Box<dyn PlayerControl> = Box::new(observer.clone());

        owned.seek_to(42.0);
        assert!((observer.current_time() - 42.0).abs() < f64::EPSILON);
        assert_eq!(observer.seeks(), vec![42.0]);
    }
}
