//! Observer stream of session state changes, for UI binding.

use tokio::sync::broadcast;

use crate::error::SessionError;
use crate::protocol::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The server reported that the participant left.
    ParticipantLeft,
    /// We left the room.
    LocalLeave,
    NegotiationFailed,
    /// The transport closed underneath the session.
    TransportClosed,
    /// The signaling channel went away.
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    RoomJoined {
        room_id: String,
        participants: Vec<ParticipantId>,
    },
    RoomLeft {
        room_id: Option<String>,
    },
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    PeerConnected(ParticipantId),
    PeerDisconnected(ParticipantId),
    PeerClosed {
        participant: ParticipantId,
        reason: CloseReason,
    },
    /// The last peer session ended.
    CallEnded,
    MuteChanged(bool),
    Error {
        participant: Option<ParticipantId>,
        error: SessionError,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomJoined { .. } => "room_joined",
            Self::RoomLeft { .. } => "room_left",
            Self::ParticipantJoined(_) => "participant_joined",
            Self::ParticipantLeft(_) => "participant_left",
            Self::PeerConnected(_) => "peer_connected",
            Self::PeerDisconnected(_) => "peer_disconnected",
            Self::PeerClosed { .. } => "peer_closed",
            Self::CallEnded => "call_ended",
            Self::MuteChanged(_) => "mute_changed",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Clone)]
pub struct Events {
    sender: broadcast::Sender<SessionEvent>,
}

impl Events {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Delivery is best-effort: with no subscribers the event is dropped.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(64)
    }
}
