pub mod presence;
pub mod store;
pub mod webrtc;

pub use presence::PresenceDirectory;
pub use store::{MemorySessionStore, SessionStore, StoredSession};
pub use webrtc::{MeshEvent, MeshManager, SignalingRelay};
