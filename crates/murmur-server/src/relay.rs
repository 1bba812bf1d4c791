//! Inbound event dispatch.
//!
//! Chat messages are broadcast first and persisted afterwards through an
//! ordered outbox drained by a single worker. Uploads are stored and
//! persisted before anything is broadcast, so peers never see a path that
//! does not exist.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use murmur_shared::{ErrorCode, InboundEvent, OutboundEvent, RoomId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::broker::{ConnectionHandle, RoomBroker};
use crate::error::ServerError;
use crate::file_store::upload_extension;
use crate::services::{FileStore, Identity, MessageRecord, PersistenceGateway, StoredFile};

/// Who sent the event being dispatched, and where to report failures.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub room_id: RoomId,
    pub identity: Identity,
    pub reply: ConnectionHandle,
}

#[derive(Debug, Default)]
pub struct RelayStats {
    messages_relayed: AtomicU64,
    messages_persisted: AtomicU64,
    persistence_failures: AtomicU64,
    uploads_stored: AtomicU64,
    uploads_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub messages_relayed: u64,
    pub messages_persisted: u64,
    pub persistence_failures: u64,
    pub uploads_stored: u64,
    pub uploads_rejected: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            messages_persisted: self.messages_persisted.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            uploads_stored: self.uploads_stored.load(Ordering::Relaxed),
            uploads_rejected: self.uploads_rejected.load(Ordering::Relaxed),
        }
    }
}

enum OutboxItem {
    Persist {
        record: MessageRecord,
        reply: ConnectionHandle,
    },
    Flush(oneshot::Sender<()>),
}

pub struct MessageRelay {
    broker: Arc<RoomBroker>,
    persistence: Arc<dyn PersistenceGateway>,
    files: Arc<dyn FileStore>,
    outbox: mpsc::UnboundedSender<OutboxItem>,
    stats: Arc<RelayStats>,
}

impl MessageRelay {
    /// Must be called inside a tokio runtime; spawns the outbox worker.
    pub fn new(
        broker: Arc<RoomBroker>,
        persistence: Arc<dyn PersistenceGateway>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        let (outbox, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RelayStats::default());
        tokio::spawn(drain_outbox(
            rx,
            Arc::clone(&persistence),
            Arc::clone(&stats),
        ));

        Self {
            broker,
            persistence,
            files,
            outbox,
            stats,
        }
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait until every chat message queued so far has been written (or has
    /// failed).
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.outbox.send(OutboxItem::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn dispatch(&self, ctx: &RelayContext, event: InboundEvent) {
        let sender_id = ctx.identity.user_id;
        match event {
            InboundEvent::UserTyping => {
                self.broker
                    .broadcast(ctx.room_id, OutboundEvent::UserTyping { sender_id })
                    .await;
            }
            InboundEvent::UserStoppedTyping => {
                self.broker
                    .broadcast(ctx.room_id, OutboundEvent::UserStoppedTyping { sender_id })
                    .await;
            }
            InboundEvent::NewMessage {
                encrypted_message,
                message_signature,
                iv,
            } => {
                self.relay_message(ctx, encrypted_message, message_signature, iv)
                    .await;
            }
            InboundEvent::NewUpload {
                file,
                file_name,
                signature,
                iv,
            } => {
                if let Err(e) = self
                    .relay_upload(ctx, file.as_bytes(), &file_name, signature, iv)
                    .await
                {
                    let code = match e {
                        ServerError::PersistenceFailure(_) => ErrorCode::PersistenceFailed,
                        _ => ErrorCode::UploadRejected,
                    };
                    warn!(room = %ctx.room_id, user = %sender_id, error = %e, "Upload failed");
                    ctx.reply.send_event(OutboundEvent::Error {
                        code,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn relay_message(
        &self,
        ctx: &RelayContext,
        encrypted_message: String,
        message_signature: String,
        iv: String,
    ) {
        let sender_id = ctx.identity.user_id;
        let record = MessageRecord {
            room_id: ctx.room_id,
            sender_id,
            sender_name: ctx.identity.display_name.clone(),
            payload: Some(encrypted_message.clone()),
            signature: message_signature.clone(),
            iv: iv.clone(),
            file: None,
        };

        let reached = self
            .broker
            .broadcast(
                ctx.room_id,
                OutboundEvent::NewMessage {
                    encrypted_message,
                    message_signature,
                    iv,
                    sender_id,
                },
            )
            .await;
        self.stats.messages_relayed.fetch_add(1, Ordering::Relaxed);
        debug!(room = %ctx.room_id, user = %sender_id, reached, "Relayed chat message");

        let queued = self.outbox.send(OutboxItem::Persist {
            record,
            reply: ctx.reply.clone(),
        });
        if queued.is_err() {
            self.stats
                .persistence_failures
                .fetch_add(1, Ordering::Relaxed);
            error!(room = %ctx.room_id, user = %sender_id, "Persistence outbox is gone");
            ctx.reply.send_event(OutboundEvent::Error {
                code: ErrorCode::PersistenceFailed,
                reason: "message was delivered but not stored".into(),
            });
        }
    }

    async fn relay_upload(
        &self,
        ctx: &RelayContext,
        blob: &[u8],
        declared_name: &str,
        signature: String,
        iv: String,
    ) -> Result<(), ServerError> {
        let stored = match self.store_upload(blob, declared_name).await {
            Ok(stored) => stored,
            Err(e) => {
                self.stats.uploads_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let record = MessageRecord {
            room_id: ctx.room_id,
            sender_id: ctx.identity.user_id,
            sender_name: ctx.identity.display_name.clone(),
            payload: None,
            signature: signature.clone(),
            iv: iv.clone(),
            file: Some(stored.clone()),
        };
        if let Err(e) = self.persistence.create_message(record).await {
            self.stats
                .persistence_failures
                .fetch_add(1, Ordering::Relaxed);
            error!(room = %ctx.room_id, file = %stored.final_name, error = %e, "Failed to persist upload");
            if let Err(discard) = self.files.discard(&stored).await {
                warn!(file = %stored.final_name, error = %discard, "Failed to discard orphaned upload");
            }
            return Err(ServerError::PersistenceFailure(e.to_string()));
        }
        self.stats
            .messages_persisted
            .fetch_add(1, Ordering::Relaxed);
        self.stats.uploads_stored.fetch_add(1, Ordering::Relaxed);

        info!(
            room = %ctx.room_id,
            user = %ctx.identity.user_id,
            file = %stored.final_name,
            size = blob.len(),
            "Upload stored"
        );
        self.broker
            .broadcast(
                ctx.room_id,
                OutboundEvent::NewUpload {
                    encrypted_file_path: stored.reference,
                    file_name: stored.final_name,
                    file_signature: signature,
                    file_iv: iv,
                    sender_id: ctx.identity.user_id,
                    sender_username: ctx.identity.display_name.clone(),
                },
            )
            .await;
        Ok(())
    }

    async fn store_upload(
        &self,
        blob: &[u8],
        declared_name: &str,
    ) -> Result<StoredFile, ServerError> {
        let extension = upload_extension(declared_name)?;
        Ok(self.files.store(blob, &extension).await?)
    }
}

async fn drain_outbox(
    mut rx: mpsc::UnboundedReceiver<OutboxItem>,
    persistence: Arc<dyn PersistenceGateway>,
    stats: Arc<RelayStats>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            OutboxItem::Persist { record, reply } => {
                let room_id = record.room_id;
                let sender_id = record.sender_id;
                match persistence.create_message(record).await {
                    Ok(id) => {
                        stats.messages_persisted.fetch_add(1, Ordering::Relaxed);
                        debug!(room = %room_id, message = id, "Chat message persisted");
                    }
                    Err(e) => {
                        stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
                        error!(
                            room = %room_id,
                            user = %sender_id,
                            error = %e,
                            "Failed to persist chat message"
                        );
                        reply.send_event(OutboundEvent::Error {
                            code: ErrorCode::PersistenceFailed,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            OutboxItem::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Persistence outbox closed");
}
