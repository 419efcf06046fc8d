//! Data-channel message taxonomy
//!
//! Every frame on a peer link is one JSON object: the stamped sender, an
//! optional target (absent means broadcast), and the message fields with a
//! `type` tag.

use serde::{Deserialize, Serialize};

use crate::models::{MediaItem, ParticipantId, PlaybackSnapshot};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    Chat {
        text: String,
    },
    Play {
        position: f64,
    },
    Pause,
    Seek {
        position: f64,
    },
    PlayItem {
        item: MediaItem,
    },
    QueueAdd {
        item: MediaItem,
    },
    /// Ask the host to queue (or play right away) an item
    RequestItem {
        item: MediaItem,
        #[serde(default)]
        play_now: bool,
    },
    GrantControl {
        participant: ParticipantId,
        granted: bool,
    },
    /// The full authorization list, host excluded
    ControlListSync {
        participants: Vec<ParticipantId>,
    },
    RequestState,
    StateSnapshot {
        state: PlaybackSnapshot,
    },
    RequestTime,
    TimeUpdate {
        position: f64,
    },
}

impl SyncMessage {
    /// Messages the host only accepts from authorized senders
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Play { .. }
                | Self::Pause
                | Self::Seek { .. }
                | Self::PlayItem { .. }
                | Self::QueueAdd { .. }
                | Self::StateSnapshot { .. }
        )
    }

    /// Messages only the host may originate
    #[must_use]
    pub const fn is_host_only(&self) -> bool {
        matches!(
            self,
            Self::GrantControl { .. } | Self::ControlListSync { .. } | Self::TimeUpdate { .. }
        )
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Play { .. } => "play",
            Self::Pause => "pause",
            Self::Seek { .. } => "seek",
            Self::PlayItem { .. } => "play-item",
            Self::QueueAdd { .. } => "queue-add",
            Self::RequestItem { .. } => "request-item",
            Self::GrantControl { .. } => "grant-control",
            Self::ControlListSync { .. } => "control-list-sync",
            Self::RequestState => "request-state",
            Self::StateSnapshot { .. } => "state-snapshot",
            Self::RequestTime => "request-time",
            Self::TimeUpdate { .. } => "time-update",
        }
    }
}

/// Wire frame: a stamped `SyncMessage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub sender: ParticipantId,
    pub sender_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ParticipantId>,
    #[serde(flatten)]
    pub message: SyncMessage,
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A message the protocol wants sent; `target: None` is a broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub target: Option<ParticipantId>,
    pub message: SyncMessage,
}

impl Outbound {
    #[must_use]
    pub const fn broadcast(message: SyncMessage) -> Self {
        Self {
            target: None,
            message,
        }
    }

    #[must_use]
    pub const fn direct(target: ParticipantId, message: SyncMessage) -> Self {
        Self {
            target: Some(target),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame {
            sender: ParticipantId::from("h"),
            sender_label: "Host".to_string(),
            target: None,
            message: SyncMessage::Seek { position: 12.5 },
        };
        let json: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "seek");
        assert_eq!(json["position"], 12.5);
        assert_eq!(json["sender"], "h");
        assert_eq!(json["senderLabel"], "Host");
        assert!(json.get("target").is_none());
    }

    #[test]
    fn test_decode_direct_frame() {
        let raw = r#"{"type":"request-item","sender":"g","senderLabel":"Guest","target":"h",
            "item":{"id":"abc","title":"Song"}}"#;
        let frame = Frame::decode(raw).unwrap();
        assert_eq!(frame.target, Some(ParticipantId::from("h")));
        match frame.message {
            SyncMessage::RequestItem { item, play_now } => {
                assert_eq!(item.id, "abc");
                assert!(!play_now);
            }
            other => panic!("unexpected message {other:?}"),
        }

        assert!(Frame::decode(r#"{"type":"warp","sender":"g","senderLabel":"G"}"#).is_err());
    }

    #[test]
    fn test_control_classification() {
        assert!(SyncMessage::Pause.is_control());
        assert!(SyncMessage::QueueAdd { item: MediaItem::new("a", "A") }.is_control());
        assert!(!SyncMessage::Chat { text: "hi".into() }.is_control());
        assert!(!SyncMessage::RequestItem { item: MediaItem::new("a", "A"), play_now: true }.is_control());
        assert!(SyncMessage::TimeUpdate { position: 1.0 }.is_host_only());
        assert!(!SyncMessage::RequestState.is_host_only());
        assert_eq!(SyncMessage::ControlListSync { participants: vec![] }.kind(), "control-list-sync");
    }
}
