//! Collaborator contracts the relay core depends on.
//!
//! The gateway and relay only ever see these traits. The production wiring
//! lives in [`crate::persistence`] (SQLite) and [`crate::file_store`] (disk).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_shared::{RoomId, UserId};
use thiserror::Error;

/// An authenticated user as seen by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Credential rejected")]
    Denied,

    #[error("Auth backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError>;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Room {0} does not exist")]
    RoomNotFound(RoomId),

    #[error("User {user} is not a participant of room {room}")]
    NotParticipant { room: RoomId, user: UserId },

    #[error("Persistence backend error: {0}")]
    Backend(String),
}

/// A message on its way to durable storage. `payload` is absent for uploads,
/// `file` is present only for uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub payload: Option<String>,
    pub signature: String,
    pub iv: String,
    pub file: Option<StoredFile>,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store the message and increment the room counter atomically.
    async fn create_message(&self, record: MessageRecord) -> Result<i64, PersistenceError>;

    async fn update_last_online(
        &self,
        room: RoomId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn room_participants(&self, room: RoomId) -> Result<(UserId, UserId), PersistenceError>;
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("Upload rejected: {0}")]
    Rejected(String),

    #[error("Upload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("File storage error: {0}")]
    Storage(String),
}

/// Where an upload ended up. `final_name` is server-chosen; `reference` is
/// what clients use to fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub final_name: String,
    pub reference: String,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persist `blob` under a fresh name ending in `.{extension}` (or no
    /// extension when empty). Names never collide.
    async fn store(&self, blob: &[u8], extension: &str) -> Result<StoredFile, FileStoreError>;

    /// Remove a file written by `store`. Missing files are not an error.
    async fn discard(&self, file: &StoredFile) -> Result<(), FileStoreError>;
}
