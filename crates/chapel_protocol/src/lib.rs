/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types shared by the call core and the rendezvous server.
//!
//! Every frame is one JSON text message tagged by `"type"`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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
}

/// Same shape as the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Frames sent by a participant to the rendezvous server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
        user_id: ParticipantId,
    },
    Offer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    Answer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    IceCandidate {
        room_id: RoomId,
        candidate: IceCandidate,
    },
    LeaveRoom {
        room_id: RoomId,
        user_id: ParticipantId,
    },
}

impl ClientMessage {
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::IceCandidate { room_id, .. }
            | Self::LeaveRoom { room_id, .. } => room_id,
        }
    }
}

/// Frames sent by the rendezvous server to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First joiner of the room.
    RoomCreated { room_id: RoomId },
    /// Second joiner of the room.
    RoomJoined { room_id: RoomId },
    /// Room already has two members.
    RoomFull { room_id: RoomId },
    Offer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    Answer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    IceCandidate {
        room_id: RoomId,
        candidate: IceCandidate,
    },
    UserDisconnected { room_id: RoomId },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_uses_camel_case_fields() {
        let msg = ClientMessage::JoinRoom {
            room_id: RoomId::new("room-42"),
            user_id: ParticipantId(1),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v, json!({"type": "join-room", "roomId": "room-42", "userId": 1}));
    }

    #[test]
    fn ice_candidate_matches_browser_init_shape() {
        let text = r#"{
            "type": "ice-candidate",
            "roomId": "r",
            "candidate": {"candidate": "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        }"#;
        let msg: ServerMessage = serde_json::from_str(text).unwrap();
        let ServerMessage::IceCandidate { room_id, candidate } = msg else {
            panic!("unexpected variant");
        };
        assert_eq!(room_id.as_str(), "r");
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn offer_payload_carries_sdp_type() {
        let msg = ClientMessage::Offer {
            room_id: RoomId::new("r"),
            sdp: SessionDescription::offer("v=0"),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "offer");
        assert_eq!(v["sdp"]["type"], "offer");
        assert_eq!(v["sdp"]["sdp"], "v=0");
    }

    #[test]
    fn user_disconnected_requires_room_id() {
        let ok: ServerMessage =
            serde_json::from_str(r#"{"type":"user-disconnected","roomId":"r"}"#).unwrap();
        assert_eq!(ok, ServerMessage::UserDisconnected { room_id: RoomId::new("r") });
        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"user-disconnected"}"#).is_err());
        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"bogus"}"#).is_err());
    }
}
