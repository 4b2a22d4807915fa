//! Wire frames exchanged with clients over the WebSocket connection.
//!
//! All frames share a `type` discriminant with a stable integer value; the
//! payload riding in `data` is itself JSON-encoded so that unknown payload
//! shapes don't break envelope decoding.

use serde::{Deserialize, Serialize};

/// Stable wire values for [`Envelope::ty`].
///
/// Serialized as a plain JSON integer (see the manual `Serialize`/
/// `Deserialize` impls below) rather than pulling in `serde_repr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum MsgType {
    Ack = 1,
    Heartbeat = 2,
    Message = 3,
    NewMessage = 4,
    FriendApply = 5,
    FriendApplyResult = 6,
    FriendInfoUpdated = 7,
    GroupApply = 8,
    GroupApplyResult = 9,
    GroupInfoUpdated = 10,
    GroupDismiss = 11,
    GroupMemberChange = 12,
}

impl MsgType {
    /// Friend/group event kinds whose delivery is tracked by the Ack-Queue
    /// and acknowledged via `ack_id` rather than `(kind, id, seq)`.
    pub fn is_ack_id_tracked(self) -> bool {
        matches!(
            self,
            MsgType::NewMessage
                | MsgType::FriendApply
                | MsgType::FriendApplyResult
                | MsgType::FriendInfoUpdated
                | MsgType::GroupApply
                | MsgType::GroupApplyResult
                | MsgType::GroupInfoUpdated
                | MsgType::GroupDismiss
                | MsgType::GroupMemberChange
        )
    }
}

/// The outer frame exchanged in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub ty: MsgType,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<i64>,
}

impl Envelope {
    pub fn new<T: Serialize>(ty: MsgType, payload: &T) -> Self {
        Self {
            ty,
            data: serde_json::to_string(payload).unwrap_or_default(),
            ack_id: None,
        }
    }

    pub fn with_ack_id(mut self, ack_id: i64) -> Self {
        self.ack_id = Some(ack_id);
        self
    }

    pub fn decode_data<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data)
    }
}

/// The fixed two-member kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Single,
    Group,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Single => "single",
            Kind::Group => "group",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `MessageMsg` envelope: one chat message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub id: i64,
    pub session_id: i64,
    pub from_id: i64,
    pub to_id: i64,
    pub seq: i64,
    pub kind: Kind,
    pub content: String,
    pub created_at: i64,
}

/// Payload of a `NewMessageMsg` notify envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessageNotify {
    pub kind: Kind,
    pub session_id: i64,
    pub seq: i64,
}

/// Payload of an `AckMsg` envelope (client -> server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(rename = "type")]
    pub ty: MsgType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

/// Client-initiated replay request, carried as the `data` of a `MessageMsg`
/// envelope sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollMessageReq {
    pub kind: Kind,
    pub session_id: i64,
    pub seq: i64,
}

/// Error codes used in log fields for collaborator/RPC failure
/// classification; never sent to the client (see error handling design).
pub mod error_codes {
    pub const RPC_CONNECT_FAILED: &str = "RPC_CONNECT_FAILED";
    pub const RPC_DISCONNECT_FAILED: &str = "RPC_DISCONNECT_FAILED";
    pub const RPC_HEARTBEAT_FAILED: &str = "RPC_HEARTBEAT_FAILED";
    pub const RPC_ACK_MESSAGE_FAILED: &str = "RPC_ACK_MESSAGE_FAILED";
    pub const RPC_LIST_GROUP_MEMBER_FAILED: &str = "RPC_LIST_GROUP_MEMBER_FAILED";
    pub const PROTOCOL_DECODE_FAILED: &str = "PROTOCOL_DECODE_FAILED";
}

use serde::de::Error as SerdeDeError;
use serde::{Deserializer, Serializer};

impl Serialize for MsgType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(*self as i64)
    }
}

impl<'de> Deserialize<'de> for MsgType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = i64::deserialize(deserializer)?;
        MsgType::from_i64(v).ok_or_else(|| D::Error::custom(format!("unknown msg type {v}")))
    }
}

impl MsgType {
    /// Parses a wire-level type value (also used to decode the event-bus
    /// content-type tag carried in friend/group event keys).
    pub fn from_wire(v: i64) -> Option<Self> {
        Self::from_i64(v)
    }

    fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            1 => MsgType::Ack,
            2 => MsgType::Heartbeat,
            3 => MsgType::Message,
            4 => MsgType::NewMessage,
            5 => MsgType::FriendApply,
            6 => MsgType::FriendApplyResult,
            7 => MsgType::FriendInfoUpdated,
            8 => MsgType::GroupApply,
            9 => MsgType::GroupApplyResult,
            10 => MsgType::GroupInfoUpdated,
            11 => MsgType::GroupDismiss,
            12 => MsgType::GroupMemberChange,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_message_body() {
        let body = MessageBody {
            id: 1,
            session_id: 42,
            from_id: 7,
            to_id: 9,
            seq: 3,
            kind: Kind::Single,
            content: "hi".to_owned(),
            created_at: 1000,
        };
        let env = Envelope::new(MsgType::Message, &body).with_ack_id(5);
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ty, MsgType::Message);
        assert_eq!(back.ack_id, Some(5));
        let decoded: MessageBody = back.decode_data().unwrap();
        assert_eq!(decoded.session_id, 42);
        assert_eq!(decoded.seq, 3);
        assert_eq!(decoded.content, "hi");
    }

    #[test]
    fn ack_payload_round_trips_message_ack() {
        let payload = AckPayload {
            ty: MsgType::Message,
            ack_id: None,
            kind: Some(Kind::Single),
            id: Some(42),
            seq: Some(7),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: AckPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, Some(42));
        assert_eq!(back.seq, Some(7));
    }

    #[test]
    fn unknown_msg_type_rejected() {
        let err = serde_json::from_str::<MsgType>("99").unwrap_err();
        assert!(err.to_string().contains("unknown msg type"));
    }
}
