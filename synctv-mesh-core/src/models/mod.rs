pub mod id;
pub mod media;
pub mod playback;
pub mod presence;

pub use id::{generate_id, ParticipantId, RoomId};
pub use media::MediaItem;
pub use playback::{PlaybackSnapshot, PlaybackState};
pub use presence::{Participant, PresenceDelta, PresenceRecord, PresenceSnapshot};
