//! Best-effort application messaging: peer-direct over the fallback data
//! channel, else relayed through the coordination server.
//!
//! There is no deduplication and no ordering across the two paths.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::peer::PeerSession;
use crate::protocol::{ClientMessage, ParticipantId};
use crate::signaling::Outbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    Relayed,
}

/// Receives application messages from other participants.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, sender: &ParticipantId, message: Value, via: Delivery);
}

#[derive(Clone, Default)]
pub struct FallbackRelay {
    handler: Option<Arc<dyn MessageHandler>>,
}

impl FallbackRelay {
    pub fn new(handler: Option<Arc<dyn MessageHandler>>) -> Self {
        Self { handler }
    }

    /// Sends `message` to `target`, preferring the peer's open fallback channel.
    pub async fn send(
        &self,
        peer: Option<&mut PeerSession>,
        target: &ParticipantId,
        message: Value,
        outbox: &mut Outbox,
    ) -> Delivery {
        if let Some(peer) = peer {
            if peer.send_direct(&message).await {
                debug!(target = %target, "message sent over fallback channel");
                return Delivery::Direct;
            }
        }
        debug!(target = %target, "relaying message through server");
        outbox.send(&ClientMessage::RelayMessage {
            target_id: target.clone(),
            message,
        });
        Delivery::Relayed
    }

    pub fn on_relayed(&self, sender: &ParticipantId, message: Value) {
        self.deliver(sender, message, Delivery::Relayed);
    }

    pub fn on_direct(&self, sender: &ParticipantId, message: Value) {
        self.deliver(sender, message, Delivery::Direct);
    }

    fn deliver(&self, sender: &ParticipantId, message: Value, via: Delivery) {
        match &self.handler {
            Some(handler) => handler.on_message(sender, message, via),
            None => debug!(sender = %sender, ?via, "no message handler; dropping message"),
        }
    }
}
