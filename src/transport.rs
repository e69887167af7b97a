//! Capabilities the session core consumes from the media stack.
//!
//! A [`PeerTransport`] is one point-to-point connection to a remote
//! participant. Everything it observes asynchronously (connectivity changes,
//! gathered candidates, the fallback data channel) is pushed back into the
//! session loop through a [`PeerEventSink`], never applied from a callback.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{IceCandidate, ParticipantId, SessionDescription};
use crate::session::Event;

/// Connectivity as reported by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl Connectivity {
    pub fn is_degraded(self) -> bool {
        matches!(self, Connectivity::Disconnected | Connectivity::Failed)
    }
}

/// Which side sends the first offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    fn connectivity(&self) -> Connectivity;
    async fn close(&self);
}

/// Peer-direct side channel riding on a transport.
#[async_trait]
pub trait FallbackChannel: Send + Sync {
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build a transport for `participant`. Initiators open the fallback
    /// channel themselves; responders wait for the remote one.
    async fn create(
        &self,
        participant: &ParticipantId,
        role: Role,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>>;
}

pub enum PeerEvent {
    Connectivity(Connectivity),
    LocalCandidate(IceCandidate),
    GatheringComplete,
    ChannelOpen(Box<dyn FallbackChannel>),
    ChannelMessage(String),
    ChannelClosed,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Connectivity(c) => f.debug_tuple("Connectivity").field(c).finish(),
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::GatheringComplete => f.write_str("GatheringComplete"),
            PeerEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            PeerEvent::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
            PeerEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// Routes transport callbacks for one peer session into the session loop.
///
/// The generation distinguishes a replaced session from its successor so late
/// callbacks from a closed transport are discarded.
#[derive(Clone)]
pub struct PeerEventSink {
    participant: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl PeerEventSink {
    pub fn new(participant: ParticipantId, generation: u64, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            participant,
            generation,
            tx,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Returns false once the session loop has gone away.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(Event::Peer {
                participant: self.participant.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}
