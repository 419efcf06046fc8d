use serde::{Deserialize, Serialize};

/// A queueable media item (a video id plus display metadata)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl MediaItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            channel: None,
            thumbnail: None,
            duration_secs: None,
        }
    }

    /// Playable URL for this item
    #[must_use]
    pub fn media_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.id)
    }

    #[must_use]
    pub fn same_item(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
