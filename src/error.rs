use std::fmt;

use thiserror::Error;

use crate::protocol::ParticipantId;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Negotiation step that failed for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddCandidate,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationStage::CreateOffer => "create_offer",
            NegotiationStage::CreateAnswer => "create_answer",
            NegotiationStage::SetLocalDescription => "set_local_description",
            NegotiationStage::SetRemoteDescription => "set_remote_description",
            NegotiationStage::AddCandidate => "add_candidate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Signaling channel is not open; the send was queued or must be retried.
    #[error("signaling channel unavailable")]
    ChannelUnavailable,

    #[error("unknown peer: {0}")]
    UnknownPeer(ParticipantId),

    #[error("negotiation with {participant} failed at {stage}: {reason}")]
    NegotiationFailed {
        participant: ParticipantId,
        stage: NegotiationStage,
        reason: String,
    },

    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("transport to {0} degraded")]
    TransportDegraded(ParticipantId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    pub fn negotiation(
        participant: &ParticipantId,
        stage: NegotiationStage,
        source: impl fmt::Display,
    ) -> Self {
        SessionError::NegotiationFailed {
            participant: participant.clone(),
            stage,
            reason: source.to_string(),
        }
    }

    /// Per-peer failures never take the whole session down.
    pub fn is_peer_scoped(&self) -> bool {
        matches!(
            self,
            SessionError::UnknownPeer(_)
                | SessionError::NegotiationFailed { .. }
                | SessionError::TransportDegraded(_)
        )
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}
