use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier the coordination server assigns to a room member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Withdraws a pending local offer. Carries that offer's SDP.
    pub fn rollback(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: sdp.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Servers report either the full roster or just a head count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Participants {
    Roster(Vec<ParticipantId>),
    Count(u64),
}

impl Participants {
    pub fn roster(&self) -> &[ParticipantId] {
        match self {
            Participants::Roster(ids) => ids,
            Participants::Count(_) => &[],
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Participants::Roster(ids) => ids.len() as u64,
            Participants::Count(n) => *n,
        }
    }
}

/// Messages this client sends to the coordination server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        target_id: ParticipantId,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "is_false")]
        ice_restart: bool,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        target_id: ParticipantId,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target_id: ParticipantId,
        candidate: IceCandidate,
    },
    LeaveRoom,
    #[serde(rename_all = "camelCase")]
    RelayMessage {
        target_id: ParticipantId,
        message: Value,
    },
    #[serde(rename_all = "camelCase")]
    IceRestart { target_id: ParticipantId },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom { .. } => "create_room",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice_candidate",
            ClientMessage::LeaveRoom => "leave_room",
            ClientMessage::RelayMessage { .. } => "relay_message",
            ClientMessage::IceRestart { .. } => "ice_restart",
        }
    }
}

/// Messages the coordination server delivers to this client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_id: String,
        participants: Participants,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        participants: Participants,
    },
    NewParticipant {
        id: ParticipantId,
        #[serde(default)]
        participants: Option<Participants>,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        sender_id: ParticipantId,
        offer: SessionDescription,
        #[serde(default)]
        ice_restart: bool,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        sender_id: ParticipantId,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        sender_id: ParticipantId,
        candidate: IceCandidate,
    },
    ParticipantLeft {
        id: ParticipantId,
        #[serde(default)]
        participants: Option<Participants>,
    },
    #[serde(rename_all = "camelCase")]
    RelayedMessage {
        sender_id: ParticipantId,
        message: Value,
    },
    #[serde(rename_all = "camelCase")]
    IceRestart { sender_id: ParticipantId },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::RoomCreated { .. } => "room_created",
            ServerMessage::RoomJoined { .. } => "room_joined",
            ServerMessage::NewParticipant { .. } => "new_participant",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice_candidate",
            ServerMessage::ParticipantLeft { .. } => "participant_left",
            ServerMessage::RelayedMessage { .. } => "relayed_message",
            ServerMessage::IceRestart { .. } => "ice_restart",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Unknown => "unknown",
        }
    }
}

/// Frames exchanged over a peer's fallback data channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelFrame {
    Candidates { candidates: Vec<IceCandidate> },
    Message { message: Value },
}

pub fn encode(msg: &ClientMessage) -> serde_json::Result<String> {
    serde_json::to_string(msg)
}

pub fn decode(raw: &str) -> serde_json::Result<ServerMessage> {
    serde_json::from_str(raw)
}

pub fn encode_frame(frame: &ChannelFrame) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

pub fn decode_frame(raw: &str) -> serde_json::Result<ChannelFrame> {
    serde_json::from_str(raw)
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_room_joined_with_roster() {
        let raw = r#"{"type":"room_joined","roomId":"R1","participants":["P1","P2"]}"#;
        match decode(raw).unwrap() {
            ServerMessage::RoomJoined {
                room_id,
                participants,
            } => {
                assert_eq!(room_id, "R1");
                assert_eq!(participants.roster(), &["P1".into(), "P2".into()]);
                assert_eq!(participants.count(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_room_created_with_count() {
        let raw = r#"{"type":"room_created","roomId":"R1","participants":1}"#;
        let msg = decode(raw).unwrap();
        let ServerMessage::RoomCreated { participants, .. } = msg else {
            panic!("expected room_created");
        };
        assert!(participants.roster().is_empty());
        assert_eq!(participants.count(), 1);
    }

    #[test]
    fn decode_ice_candidate_keeps_browser_field_names() {
        let raw = r#"{
            "type":"ice_candidate",
            "senderId":"P2",
            "candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}
        }"#;
        let ServerMessage::IceCandidate {
            sender_id,
            candidate,
        } = decode(raw).unwrap()
        else {
            panic!("expected ice_candidate");
        };
        assert_eq!(sender_id.as_str(), "P2");
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
    }

    #[test]
    fn unknown_type_decodes_as_unknown() {
        let msg = decode(r#"{"type":"speaker_connected"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
    }

    #[test]
    fn malformed_message_is_an_error() {
        assert!(decode(r#"{"type":"answer","senderId":"P2"}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn encode_offer_uses_target_id_and_omits_restart_flag() {
        let msg = ClientMessage::Offer {
            target_id: "P2".into(),
            offer: SessionDescription::offer("v=0"),
            ice_restart: false,
        };
        let v: Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(
            v,
            json!({"type":"offer","targetId":"P2","offer":{"type":"offer","sdp":"v=0"}})
        );
    }

    #[test]
    fn encode_restart_offer_sets_flag() {
        let msg = ClientMessage::Offer {
            target_id: "P2".into(),
            offer: SessionDescription::offer("v=0"),
            ice_restart: true,
        };
        let v: Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(v["iceRestart"], json!(true));
    }

    #[test]
    fn encode_relay_and_leave() {
        let relay = ClientMessage::RelayMessage {
            target_id: "P3".into(),
            message: json!({"text":"hi"}),
        };
        let v: Value = serde_json::from_str(&encode(&relay).unwrap()).unwrap();
        assert_eq!(
            v,
            json!({"type":"relay_message","targetId":"P3","message":{"text":"hi"}})
        );

        let leave = encode(&ClientMessage::LeaveRoom).unwrap();
        assert_eq!(leave, r#"{"type":"leave_room"}"#);

        let create = encode(&ClientMessage::CreateRoom { room_id: None }).unwrap();
        assert_eq!(create, r#"{"type":"create_room"}"#);
    }

    #[test]
    fn channel_frame_candidates() {
        let frame = ChannelFrame::Candidates {
            candidates: vec![IceCandidate::new("a"), IceCandidate::new("b")],
        };
        let raw = encode_frame(&frame).unwrap();
        assert!(raw.starts_with(r#"{"type":"candidates""#));
        assert_eq!(decode_frame(&raw).unwrap(), frame);
    }
}
