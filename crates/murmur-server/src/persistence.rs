//! SQLite-backed implementations of [`AuthService`] and [`PersistenceGateway`].
//!
//! `rusqlite` is blocking, so every call hops onto the blocking pool and takes
//! the connection mutex there. No async lock is held across these calls.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_shared::{RoomId, UserId};
use murmur_store::{Database, FileAttachment, NewMessage, StoreError};
use tracing::debug;

use crate::services::{
    AuthError, AuthService, Identity, MessageRecord, PersistenceError, PersistenceGateway,
};

#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<Mutex<Database>>,
}

impl SqliteBackend {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a store operation on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| StoreError::Unavailable("database lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

fn map_room_error(room: RoomId, e: StoreError) -> PersistenceError {
    match e {
        StoreError::NotFound => PersistenceError::RoomNotFound(room),
        StoreError::NotParticipant { room, user } => PersistenceError::NotParticipant { room, user },
        other => PersistenceError::Backend(other.to_string()),
    }
}

#[async_trait]
impl AuthService for SqliteBackend {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::Denied);
        }

        let token = credential.to_string();
        match self.run(move |db| db.user_for_token(&token)).await {
            Ok(user) => Ok(Identity {
                user_id: user.id,
                display_name: user.username,
            }),
            Err(StoreError::NotFound) => Err(AuthError::Denied),
            Err(e) => Err(AuthError::Backend(e.to_string())),
        }
    }
}

#[async_trait]
impl PersistenceGateway for SqliteBackend {
    async fn create_message(&self, record: MessageRecord) -> Result<i64, PersistenceError> {
        let room = record.room_id;
        let new = NewMessage {
            room_id: record.room_id,
            sender_id: record.sender_id,
            sender_username: record.sender_name,
            content: record.payload,
            file: record.file.map(|f| FileAttachment {
                path: f.reference,
                name: f.final_name,
            }),
            signature: record.signature,
            iv: record.iv,
        };

        let stored = self
            .run(move |db| db.insert_message(&new))
            .await
            .map_err(|e| map_room_error(room, e))?;

        debug!(room = %room, message = stored.id, is_file = stored.is_file, "message stored");
        Ok(stored.id)
    }

    async fn update_last_online(
        &self,
        room: RoomId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.run(move |db| db.update_last_online(room, user, at))
            .await
            .map_err(|e| map_room_error(room, e))
    }

    async fn room_participants(&self, room: RoomId) -> Result<(UserId, UserId), PersistenceError> {
        self.run(move |db| db.room_participants(room))
            .await
            .map_err(|e| map_room_error(room, e))
    }
}
