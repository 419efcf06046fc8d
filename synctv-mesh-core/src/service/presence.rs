//! Presence directory
//!
//! Tracks the local participant on the room channel and republishes every
//! membership sync as a `PresenceSnapshot`. A channel disconnect publishes
//! an empty snapshot; reconnecting the channel is the transport's job.

use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{Participant, PresenceSnapshot};
use crate::transport::{ChannelEvent, RoomChannel};
use crate::Result;

pub struct PresenceDirectory {
    channel: Arc<dyn RoomChannel>,
    identity: Participant,
    snapshots: watch::Receiver<PresenceSnapshot>,
    cancel: CancellationToken,
}

impl PresenceDirectory {
    /// Subscribe to the channel, then announce `identity` on it
    pub async fn join(channel: Arc<dyn RoomChannel>, identity: Participant) -> Result<Self> {
        let mut events = channel.subscribe();
        let (snapshot_tx, snapshots) = watch::channel(PresenceSnapshot::new());
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let participant_id = identity.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(ChannelEvent::PresenceSync(snapshot)) => {
                            debug!(
                                participant_id = %participant_id,
                                members = snapshot.len(),
                                "Presence sync"
                            );
                            snapshot_tx.send_replace(snapshot);
                        }
                        Some(ChannelEvent::PresenceJoin { participant_id: joined }) => {
                            debug!(participant_id = %joined, "Presence join");
                        }
                        Some(ChannelEvent::PresenceLeave { participant_id: left }) => {
                            debug!(participant_id = %left, "Presence leave");
                        }
                        Some(ChannelEvent::Signal(_)) => {}
                        Some(ChannelEvent::Disconnected) => {
                            warn!(participant_id = %participant_id, "Room channel disconnected");
                            snapshot_tx.send_replace(PresenceSnapshot::new());
                        }
                        None => {
                            snapshot_tx.send_replace(PresenceSnapshot::new());
                            break;
                        }
                    }
                }
            }
        });

        channel.track(identity.presence_record()).await?;
        info!(
            participant_id = %identity.id,
            display_name = %identity.display_name,
            "Joined presence"
        );

        Ok(Self {
            channel,
            identity,
            snapshots,
            cancel,
        })
    }

    /// Latest snapshot
    #[must_use]
    pub fn current(&self) -> PresenceSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Snapshot stream starting with the current value; each call starts a
    /// fresh stream
    #[must_use]
    pub fn updates(&self) -> WatchStream<PresenceSnapshot> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Stop publishing and withdraw from the channel
    pub async fn leave(&self) {
        self.cancel.cancel();
        if let Err(e) = self.channel.untrack().await {
            warn!(participant_id = %self.identity.id, error = %e, "Failed to untrack presence");
        }
        info!(participant_id = %self.identity.id, "Left presence");
    }
}
