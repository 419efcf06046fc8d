use serde::{Deserialize, Serialize};

use super::media::MediaItem;

/// Local replica of the room's playback state
///
/// The host's replica is authoritative; every other participant keeps
/// theirs convergent through the sync protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub media_url: String,
    pub is_playing: bool,
    pub queue: Vec<MediaItem>,
    pub current_item: Option<MediaItem>,
    pub position: f64, // playback position in seconds
    #[serde(default)]
    pub version: u64,
}

impl PlaybackState {
    #[must_use]
    pub fn with_queue(queue: Vec<MediaItem>) -> Self {
        Self {
            queue,
            ..Self::default()
        }
    }

    pub fn play(&mut self) {
        self.is_playing = true;
        self.version += 1;
    }

    pub fn pause(&mut self) {
        self.is_playing = false;
        self.version += 1;
    }

    pub fn seek(&mut self, position: f64) {
        self.position = position;
        self.version += 1;
    }

    pub fn switch_item(&mut self, item: MediaItem) {
        self.media_url = item.media_url();
        self.current_item = Some(item);
        self.position = 0.0;
        self.is_playing = true;
        self.version += 1;
    }

    pub fn enqueue(&mut self, item: MediaItem) {
        self.queue.push(item);
        self.version += 1;
    }

    /// Record a progress sample without counting it as a state change
    pub fn observe_position(&mut self, position: f64) {
        self.position = position;
    }

    #[must_use]
    pub fn is_current(&self, item: &MediaItem) -> bool {
        self.current_item
            .as_ref()
            .is_some_and(|current| current.same_item(item))
    }

    /// Index of the current item within the queue
    #[must_use]
    pub fn current_index(&self) -> Option<usize> {
        let current = self.current_item.as_ref()?;
        self.queue.iter().position(|item| item.same_item(current))
    }

    /// Replace everything the host is authoritative for
    pub fn replace_from(&mut self, snapshot: &PlaybackSnapshot) {
        self.queue = snapshot.queue.clone();
        self.current_item = snapshot.current_item.clone();
        if !snapshot.media_url.is_empty() {
            self.media_url = snapshot.media_url.clone();
        }
        self.is_playing = snapshot.is_playing;
        self.position = snapshot.position;
        self.version += 1;
    }
}

/// Full playback state plus the position sampled when it was sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub media_url: String,
    pub is_playing: bool,
    pub queue: Vec<MediaItem>,
    pub current_item: Option<MediaItem>,
    pub position: f64,
}

impl PlaybackSnapshot {
    #[must_use]
    pub fn capture(state: &PlaybackState, position: f64) -> Self {
        Self {
            media_url: state.media_url.clone(),
            is_playing: state.is_playing,
            queue: state.queue.clone(),
            current_item: state.current_item.clone(),
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_item_resets_position() {
        let mut state = PlaybackState::default();
        state.seek(30.0);
        state.switch_item(MediaItem::new("v1", "One"));

        assert_eq!(state.position, 0.0);
        assert!(state.is_playing);
        assert_eq!(state.media_url, "https://www.youtube.com/watch?v=v1");
        assert!(state.is_current(&MediaItem::new("v1", "other title")));
        assert_eq!(state.version, 2);
    }

    #[test]
    fn test_current_index() {
        let mut state = PlaybackState::with_queue(vec![
            MediaItem::new("a", "A"),
            MediaItem::new("b", "B"),
        ]);
        assert_eq!(state.current_index(), None);

        state.switch_item(MediaItem::new("b", "B"));
        assert_eq!(state.current_index(), Some(1));
    }

    #[test]
    fn test_replace_from_snapshot() {
        let mut host = PlaybackState::with_queue(vec![MediaItem::new("a", "A")]);
        host.switch_item(MediaItem::new("a", "A"));
        let snapshot = PlaybackSnapshot::capture(&host, 42.0);

        let mut guest = PlaybackState::default();
        guest.replace_from(&snapshot);

        assert_eq!(guest.queue, host.queue);
        assert_eq!(guest.current_item, host.current_item);
        assert_eq!(guest.media_url, host.media_url);
        assert!(guest.is_playing);
        assert_eq!(guest.position, 42.0);
    }
}
