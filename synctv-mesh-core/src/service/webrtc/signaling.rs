//! Signaling relay
//!
//! Handshake fragments travel over the shared room channel as broadcasts
//! carrying an explicit target; every recipient except the target drops
//! them. Delivery is per-sender FIFO at best and may duplicate, so
//! consumers must be idempotent.

use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{SignalEnvelope, SignalPayload};
use crate::models::ParticipantId;
use crate::transport::{ChannelEvent, RoomChannel};

#[derive(Clone)]
pub struct SignalingRelay {
    local_id: ParticipantId,
    local_label: String,
    channel: Arc<dyn RoomChannel>,
}

impl std::fmt::Debug for SignalingRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingRelay")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl SignalingRelay {
    #[must_use]
    pub fn new(local_id: ParticipantId, local_label: String, channel: Arc<dyn RoomChannel>) -> Self {
        Self {
            local_id,
            local_label,
            channel,
        }
    }

    #[must_use]
    pub const fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Address a fragment to `target` and hand it to the channel.
    ///
    /// Fire-and-forget: a failed send is logged and the handshake is left
    /// to the reconnect path.
    pub fn send(&self, target: &ParticipantId, signal: SignalPayload) {
        let kind = signal.kind();
        let envelope = SignalEnvelope {
            target: target.clone(),
            sender: self.local_id.clone(),
            sender_label: self.local_label.clone(),
            signal,
        };

        match self.channel.send_signal(envelope) {
            Ok(()) => debug!(
                target_id = %target,
                kind = kind.as_str(),
                "Signal sent"
            ),
            Err(e) => warn!(
                target_id = %target,
                kind = kind.as_str(),
                error = %e,
                "Failed to send signal"
            ),
        }
    }

    /// Whether an envelope is addressed to the local participant
    #[must_use]
    pub fn accepts(&self, envelope: &SignalEnvelope) -> bool {
        envelope.target == self.local_id && envelope.sender != self.local_id
    }

    /// Every envelope addressed to the local participant, in channel order
    #[must_use]
    pub fn inbound(&self) -> BoxStream<'static, SignalEnvelope> {
        let local_id = self.local_id.clone();
        self.channel
            .subscribe()
            .filter_map(move |event| {
                let accepted = match event {
                    ChannelEvent::Signal(envelope)
                        if envelope.target == local_id && envelope.sender != local_id =>
                    {
                        Some(envelope)
                    }
                    _ => None,
                };
                futures::future::ready(accepted)
            })
            .boxed()
    }
}
