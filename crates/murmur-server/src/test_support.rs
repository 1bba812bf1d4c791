//! Shared fixtures: a fully wired relay over an in-memory database and a
//! temporary upload directory, seeded with two users sharing one room.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use murmur_shared::{RoomId, UserId};
use murmur_store::Database;
use tempfile::TempDir;

use crate::api::AppState;
use crate::broker::{Delivery, RoomBroker};
use crate::config::ServerConfig;
use crate::file_store::DiskFileStore;
use crate::gateway::{Connection, ConnectionGateway};
use crate::persistence::SqliteBackend;
use crate::presence::PresenceRegistry;
use crate::relay::MessageRelay;

pub struct Harness {
    pub gateway: Arc<ConnectionGateway>,
    pub presence: Arc<PresenceRegistry>,
    pub broker: Arc<RoomBroker>,
    pub relay: Arc<MessageRelay>,
    pub files: Arc<DiskFileStore>,
    pub backend: SqliteBackend,
    pub config: Arc<ServerConfig>,
    pub room: RoomId,
    pub alice: UserId,
    pub bob: UserId,
    pub alice_token: String,
    pub bob_token: String,
    _uploads: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_idle_timeout(None).await
    }

    pub async fn with_idle_timeout(idle_timeout: Option<Duration>) -> Self {
        let uploads = TempDir::new().unwrap();
        let backend = SqliteBackend::new(Database::open_in_memory().unwrap());
        let (room, alice, bob, alice_token, bob_token) = backend
            .run(|db| {
                let alice = db.create_user("alice", None)?;
                let bob = db.create_user("bob", None)?;
                let room = db.create_room(alice.id, bob.id)?;
                Ok((
                    room.id,
                    alice.id,
                    bob.id,
                    db.issue_token(alice.id)?,
                    db.issue_token(bob.id)?,
                ))
            })
            .await
            .unwrap();

        let config = Arc::new(ServerConfig {
            upload_dir: uploads.path().to_path_buf(),
            max_upload_size: 1024 * 1024,
            idle_timeout,
            ..ServerConfig::default()
        });
        let files = Arc::new(
            DiskFileStore::new(config.upload_dir.clone(), config.max_upload_size)
                .await
                .unwrap(),
        );
        let presence = Arc::new(PresenceRegistry::new());
        let broker = Arc::new(RoomBroker::new());
        let persistence = Arc::new(backend.clone());
        let relay = Arc::new(MessageRelay::new(
            Arc::clone(&broker),
            persistence.clone(),
            files.clone(),
        ));
        let gateway = Arc::new(ConnectionGateway::new(
            Arc::clone(&presence),
            Arc::clone(&broker),
            persistence.clone(),
            persistence,
            Arc::clone(&relay),
        ));

        Self {
            gateway,
            presence,
            broker,
            relay,
            files,
            backend,
            config,
            room,
            alice,
            bob,
            alice_token,
            bob_token,
            _uploads: uploads,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            gateway: Arc::clone(&self.gateway),
            presence: Arc::clone(&self.presence),
            broker: Arc::clone(&self.broker),
            relay: Arc::clone(&self.relay),
            files: Arc::clone(&self.files),
            config: Arc::clone(&self.config),
        }
    }

    /// Connect alice then bob and drain the join notices.
    pub async fn pair(&self) -> (Connection, Connection) {
        let mut a = self.gateway.connect(&self.alice_token, self.room).await.unwrap();
        let mut b = self.gateway.connect(&self.bob_token, self.room).await.unwrap();
        drain(&mut a, 2).await;
        drain(&mut b, 1).await;
        (a, b)
    }

    pub async fn num_messages(&self) -> i64 {
        let room = self.room;
        self.backend
            .run(move |db| db.get_room(room).map(|r| r.num_messages))
            .await
            .unwrap()
    }

    pub async fn last_online(&self, user: UserId) -> Option<DateTime<Utc>> {
        let room = self.room;
        self.backend
            .run(move |db| db.last_online_of(room, user))
            .await
            .unwrap()
    }
}

async fn drain(conn: &mut Connection, count: usize) {
    for _ in 0..count {
        let delivery =
            tokio::time::timeout(Duration::from_secs(2), conn.next_delivery())
                .await
                .unwrap()
                .unwrap();
        assert!(matches!(delivery, Delivery::Event(_)));
    }
}

/// Client frames as they appear on the wire.
pub mod frame {
    pub fn new_message(body: &str, signature: &str, iv: &str) -> String {
        serde_json::json!({
            "message_type": "new_message",
            "encrypted_message": body,
            "message_signature": signature,
            "iv": iv,
        })
        .to_string()
    }

    pub fn new_upload(file: &str, file_name: &str, signature: &str, iv: &str) -> String {
        serde_json::json!({
            "message_type": "new_upload",
            "file": file,
            "fileName": file_name,
            "signature": signature,
            "iv": iv,
        })
        .to_string()
    }
}
