//! Domain model structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use murmur_shared::{RoomId, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    /// Unique login / display name.
    pub username: String,
    /// Client-held public key, stored verbatim.
    pub public_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// Which of the two participant columns a user occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantSlot {
    First,
    Second,
}

/// A two-party conversation. The participant pair never changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub user1: UserId,
    pub user2: UserId,
    pub user1_last_online: Option<DateTime<Utc>>,
    pub user2_last_online: Option<DateTime<Utc>>,
    /// Incremented once per stored message, in the same transaction.
    pub num_messages: i64,
    pub last_message_time: Option<DateTime<Utc>>,
}

impl Room {
    pub fn participants(&self) -> (UserId, UserId) {
        (self.user1, self.user2)
    }

    pub fn slot_of(&self, user: UserId) -> Option<ParticipantSlot> {
        if user == self.user1 {
            Some(ParticipantSlot::First)
        } else if user == self.user2 {
            Some(ParticipantSlot::Second)
        } else {
            None
        }
    }

    pub fn last_online_of(&self, user: UserId) -> Option<DateTime<Utc>> {
        match self.slot_of(user)? {
            ParticipantSlot::First => self.user1_last_online,
            ParticipantSlot::Second => self.user2_last_online,
        }
    }

    /// The participant that is not `user`.
    pub fn peer_of(&self, user: UserId) -> Option<UserId> {
        match self.slot_of(user)? {
            ParticipantSlot::First => Some(self.user2),
            ParticipantSlot::Second => Some(self.user1),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A stored message. Content, signature and iv are opaque client strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_username: String,
    pub content: Option<String>,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub is_file: bool,
    pub signature: String,
    pub iv: String,
    /// Server-assigned at insert time.
    pub timestamp: DateTime<Utc>,
}

/// Reference to an upload already written by the file store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileAttachment {
    pub path: String,
    pub name: String,
}

/// Insert payload for [`Database::insert_message`](crate::Database::insert_message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_username: String,
    pub content: Option<String>,
    pub file: Option<FileAttachment>,
    pub signature: String,
    pub iv: String,
}
