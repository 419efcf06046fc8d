//! Persistence collaborator
//!
//! The engine reads the stored session once at start and mirrors the queue
//! back only on host-confirmed mutations.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::models::{MediaItem, ParticipantId, RoomId};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub host_id: ParticipantId,
    pub queue: Vec<MediaItem>,
    /// Participants granted control when the session was saved
    pub authorization_seed: Vec<ParticipantId>,
}

impl StoredSession {
    #[must_use]
    pub const fn new(host_id: ParticipantId) -> Self {
        Self {
            host_id,
            queue: Vec::new(),
            authorization_seed: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session_state(&self, room_id: &RoomId) -> Result<StoredSession>;

    async fn save_queue(&self, room_id: &RoomId, queue: &[MediaItem]) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<RoomId, StoredSession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, room_id: RoomId, session: StoredSession) {
        self.sessions.insert(room_id, session);
    }

    #[must_use]
    pub fn queue(&self, room_id: &RoomId) -> Option<Vec<MediaItem>> {
        self.sessions.get(room_id).map(|s| s.queue.clone())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_session_state(&self, room_id: &RoomId) -> Result<StoredSession> {
        self.sessions
            .get(room_id)
            .map(|s| s.clone())
            .ok_or_else(|| Error::NotFound(format!("session {room_id}")))
    }

    async fn save_queue(&self, room_id: &RoomId, queue: &[MediaItem]) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(room_id)
            .ok_or_else(|| Error::NotFound(format!("session {room_id}")))?;
        session.queue = queue.to_vec();
        debug!(room_id = %room_id, items = queue.len(), "Queue saved");
        Ok(())
    }
}
