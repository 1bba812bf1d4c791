//! JSON envelopes exchanged over the chat socket.
//!
//! Every frame is an object tagged by `message_type`. Payload fields
//! (`encrypted_message`, signatures, ivs, upload contents) are opaque strings
//! produced by the clients; the relay forwards them without interpretation.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::UserId;

/// Frames a client may send once its connection is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// The client started typing
    UserTyping,

    /// The client stopped typing
    UserStoppedTyping,

    /// An encrypted chat message
    NewMessage {
        encrypted_message: String,
        message_signature: String,
        iv: String,
    },

    /// An encrypted file. `file_name` is the name declared by the client and
    /// is only consulted for its extension.
    NewUpload {
        file: String,
        #[serde(rename = "fileName")]
        file_name: String,
        signature: String,
        iv: String,
    },
}

impl InboundEvent {
    /// Decode a text frame. Unknown kinds and missing fields are errors.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserTyping => "user_typing",
            Self::UserStoppedTyping => "user_stopped_typing",
            Self::NewMessage { .. } => "new_message",
            Self::NewUpload { .. } => "new_upload",
        }
    }
}

/// Machine-readable reason carried by an [`OutboundEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A message was delivered live but could not be stored.
    PersistenceFailed,
    /// An upload was refused before anything was broadcast.
    UploadRejected,
}

/// Frames the relay sends to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum OutboundEvent {
    UserJoined {
        joined_user_id: UserId,
        connected_username: String,
        /// Full presence snapshot at the time of the join
        connected_users: Vec<UserId>,
    },

    UserDisconnected {
        disconnected_user_id: UserId,
        disconnected_username: String,
        /// Full presence snapshot after the departure
        connected_users: Vec<UserId>,
    },

    UserTyping {
        sender_id: UserId,
    },

    UserStoppedTyping {
        sender_id: UserId,
    },

    NewMessage {
        encrypted_message: String,
        message_signature: String,
        iv: String,
        sender_id: UserId,
    },

    NewUpload {
        encrypted_file_path: String,
        file_name: String,
        file_signature: String,
        file_iv: String,
        sender_id: UserId,
        sender_username: String,
    },

    /// Sent only to the connection whose request failed.
    Error {
        code: ErrorCode,
        reason: String,
    },
}

impl OutboundEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// The identity that produced this event, if any.
    pub fn origin(&self) -> Option<UserId> {
        match self {
            Self::UserJoined { joined_user_id, .. } => Some(*joined_user_id),
            Self::UserDisconnected {
                disconnected_user_id,
                ..
            } => Some(*disconnected_user_id),
            Self::UserTyping { sender_id }
            | Self::UserStoppedTyping { sender_id }
            | Self::NewMessage { sender_id, .. }
            | Self::NewUpload { sender_id, .. } => Some(*sender_id),
            Self::Error { .. } => None,
        }
    }

    /// Receiver-side filter. Broadcasts always reach the whole room; each
    /// recipient drops the notifications it produced itself.
    ///
    /// Join notices and uploads are shown to their originator too: the joiner
    /// needs the presence snapshot and the uploader needs the stored path.
    pub fn is_visible_to(&self, recipient: UserId) -> bool {
        match self {
            Self::UserTyping { .. }
            | Self::UserStoppedTyping { .. }
            | Self::NewMessage { .. }
            | Self::UserDisconnected { .. } => self.origin() != Some(recipient),
            Self::UserJoined { .. } | Self::NewUpload { .. } | Self::Error { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_typing_frames() {
        let ev = InboundEvent::decode(r#"{"message_type":"user_typing"}"#).unwrap();
        assert_eq!(ev, InboundEvent::UserTyping);

        let ev = InboundEvent::decode(r#"{"message_type":"user_stopped_typing","extra":1}"#)
            .unwrap();
        assert_eq!(ev, InboundEvent::UserStoppedTyping);
    }

    #[test]
    fn decodes_new_message() {
        let ev = InboundEvent::decode(
            r#"{"message_type":"new_message","encrypted_message":"X","message_signature":"S","iv":"I"}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            InboundEvent::NewMessage {
                encrypted_message: "X".into(),
                message_signature: "S".into(),
                iv: "I".into(),
            }
        );
        assert_eq!(ev.kind(), "new_message");
    }

    #[test]
    fn decodes_new_upload_with_camel_case_file_name() {
        let ev = InboundEvent::decode(
            r#"{"message_type":"new_upload","file":"b64","fileName":"secret.png","signature":"S","iv":"I"}"#,
        )
        .unwrap();
        match ev {
            InboundEvent::NewUpload { file_name, file, .. } => {
                assert_eq!(file_name, "secret.png");
                assert_eq!(file, "b64");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_kind_missing_fields_and_garbage() {
        assert!(InboundEvent::decode(r#"{"message_type":"delete_everything"}"#).is_err());
        assert!(InboundEvent::decode(r#"{"message_type":"new_message","iv":"I"}"#).is_err());
        assert!(InboundEvent::decode(r#"{"encrypted_message":"X"}"#).is_err());
        assert!(matches!(
            InboundEvent::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn outbound_wire_shape() {
        let ev = OutboundEvent::NewMessage {
            encrypted_message: "X".into(),
            message_signature: "S".into(),
            iv: "I".into(),
            sender_id: UserId(1),
        };
        let value: serde_json::Value = serde_json::from_str(&ev.to_json().unwrap()).unwrap();
        assert_eq!(value["message_type"], "new_message");
        assert_eq!(value["encrypted_message"], "X");
        assert_eq!(value["sender_id"], 1);

        let err = OutboundEvent::Error {
            code: ErrorCode::UploadRejected,
            reason: "empty".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&err.to_json().unwrap()).unwrap();
        assert_eq!(value["message_type"], "error");
        assert_eq!(value["code"], "upload_rejected");
    }

    #[test]
    fn self_originated_chatter_is_hidden_from_sender() {
        let alice = UserId(1);
        let bob = UserId(2);

        let typing = OutboundEvent::UserTyping { sender_id: alice };
        assert!(!typing.is_visible_to(alice));
        assert!(typing.is_visible_to(bob));

        let left = OutboundEvent::UserDisconnected {
            disconnected_user_id: alice,
            disconnected_username: "alice".into(),
            connected_users: vec![bob],
        };
        assert!(!left.is_visible_to(alice));
        assert!(left.is_visible_to(bob));
    }

    #[test]
    fn joins_and_uploads_reach_everyone() {
        let alice = UserId(1);
        let joined = OutboundEvent::UserJoined {
            joined_user_id: alice,
            connected_username: "alice".into(),
            connected_users: vec![alice],
        };
        assert!(joined.is_visible_to(alice));

        let upload = OutboundEvent::NewUpload {
            encrypted_file_path: "uploads/file.png".into(),
            file_name: "file.png".into(),
            file_signature: "S".into(),
            file_iv: "I".into(),
            sender_id: alice,
            sender_username: "alice".into(),
        };
        assert!(upload.is_visible_to(alice));
        assert_eq!(upload.origin(), Some(alice));
    }
}
