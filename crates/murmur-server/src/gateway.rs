//! Per-connection lifecycle: `Connecting -> Active -> Closing -> Closed`.
//!
//! [`ConnectionGateway::connect`] runs the whole Connecting phase and only
//! hands out a [`Connection`] once it is `Active`. Dropping a connection that
//! never reached `Closed` still runs the Closing steps on a spawned task.
//! The Closing steps always run on their own task, so an aborted `close`
//! still finishes them exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use murmur_shared::constants::{
    CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_IDLE_TIMEOUT, CLOSE_NORMAL, CLOSE_ROOM_LOST,
    CLOSE_TRANSPORT,
};
use murmur_shared::{InboundEvent, OutboundEvent, RoomId, UserId};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{ConnectionHandle, Delivery, RoomBroker};
use crate::error::ServerError;
use crate::presence::PresenceRegistry;
use crate::relay::{MessageRelay, RelayContext};
use crate::services::{AuthError, AuthService, Identity, PersistenceError, PersistenceGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed or the stream ended.
    Normal,
    MalformedEnvelope(String),
    RoomLost,
    ServerShutdown,
    IdleTimeout,
    /// The socket failed; no close frame can be sent.
    Transport(String),
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::Normal => CLOSE_NORMAL,
            Self::MalformedEnvelope(_) => CLOSE_ABNORMAL,
            Self::RoomLost => CLOSE_ROOM_LOST,
            Self::ServerShutdown => CLOSE_GOING_AWAY,
            Self::IdleTimeout => CLOSE_IDLE_TIMEOUT,
            Self::Transport(_) => CLOSE_TRANSPORT,
        }
    }

    /// Short text for the close frame.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "bye",
            Self::MalformedEnvelope(_) => "malformed envelope",
            Self::RoomLost => "room lost",
            Self::ServerShutdown => "server shutting down",
            Self::IdleTimeout => "idle timeout",
            Self::Transport(_) => "transport error",
        }
    }

    pub fn sends_frame(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

pub struct ConnectionGateway {
    presence: Arc<PresenceRegistry>,
    broker: Arc<RoomBroker>,
    auth: Arc<dyn AuthService>,
    persistence: Arc<dyn PersistenceGateway>,
    relay: Arc<MessageRelay>,
    /// Held from the presence change until its snapshot is broadcast, so
    /// snapshots go out in the order presence changed.
    announce: Mutex<()>,
    live: AtomicUsize,
    drained: Notify,
}

impl ConnectionGateway {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        broker: Arc<RoomBroker>,
        auth: Arc<dyn AuthService>,
        persistence: Arc<dyn PersistenceGateway>,
        relay: Arc<MessageRelay>,
    ) -> Self {
        Self {
            presence,
            broker,
            auth,
            persistence,
            relay,
            announce: Mutex::new(()),
            live: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Connections admitted whose Closing steps have not finished yet.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Wait until every admitted connection has finished closing. Returns
    /// `false` if `limit` elapsed first.
    pub async fn wait_until_drained(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.live_connections() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }

    fn finished(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub async fn authenticate(&self, credential: &str) -> Result<Identity, ServerError> {
        match self.auth.authenticate(credential).await {
            Ok(identity) => Ok(identity),
            Err(AuthError::Denied) => Err(ServerError::AuthenticationFailure),
            Err(AuthError::Backend(e)) => {
                error!(error = %e, "Auth backend failed");
                Err(ServerError::Internal(e))
            }
        }
    }

    /// Authenticate and admit in one step.
    pub async fn connect(
        self: &Arc<Self>,
        credential: &str,
        room_id: RoomId,
    ) -> Result<Connection, ServerError> {
        let identity = self.authenticate(credential).await?;
        self.open(identity, room_id).await
    }

    /// Admit an authenticated identity into a room.
    pub async fn open(
        self: &Arc<Self>,
        identity: Identity,
        room_id: RoomId,
    ) -> Result<Connection, ServerError> {
        let (first, second) = match self.persistence.room_participants(room_id).await {
            Ok(pair) => pair,
            Err(PersistenceError::RoomNotFound(_)) => return Err(ServerError::UnknownRoom(room_id)),
            Err(e) => return Err(ServerError::PersistenceFailure(e.to_string())),
        };
        let user_id = identity.user_id;
        if user_id != first && user_id != second {
            warn!(
                room = %room_id,
                user = %user_id,
                "Admitting a user who is not a participant of this room"
            );
        }

        let (handle, rx) = ConnectionHandle::new(user_id);
        let mut connection = Connection {
            gateway: Arc::clone(self),
            handle,
            identity,
            room_id,
            state: ConnectionState::Connecting,
            rx,
        };

        self.live.fetch_add(1, Ordering::AcqRel);

        {
            let _announce = self.announce.lock().await;
            self.presence.add(user_id).await;
            self.broker.join(room_id, connection.handle.clone()).await;
            let snapshot = self.presence.snapshot().await;
            self.broker
                .broadcast(
                    room_id,
                    OutboundEvent::UserJoined {
                        joined_user_id: user_id,
                        connected_username: connection.identity.display_name.clone(),
                        connected_users: snapshot,
                    },
                )
                .await;
        }
        self.stamp_last_online(room_id, user_id).await;

        connection.state = ConnectionState::Active;
        info!(
            room = %room_id,
            user = %user_id,
            connection = %connection.handle.connection_id,
            "Connection active"
        );
        Ok(connection)
    }

    async fn release(&self, handle: &ConnectionHandle, identity: &Identity, room_id: RoomId) {
        let user_id = identity.user_id;
        {
            let _announce = self.announce.lock().await;
            self.presence.remove(user_id).await;
            self.broker.leave(room_id, handle.connection_id).await;

            let snapshot = self.presence.snapshot().await;
            self.broker
                .broadcast(
                    room_id,
                    OutboundEvent::UserDisconnected {
                        disconnected_user_id: user_id,
                        disconnected_username: identity.display_name.clone(),
                        connected_users: snapshot,
                    },
                )
                .await;
        }
        self.stamp_last_online(room_id, user_id).await;
    }

    async fn stamp_last_online(&self, room_id: RoomId, user_id: UserId) {
        if let Err(e) = self
            .persistence
            .update_last_online(room_id, user_id, Utc::now())
            .await
        {
            warn!(room = %room_id, user = %user_id, error = %e, "Failed to update last online");
        }
    }
}

/// One admitted socket. Owned by the task that drives the socket.
pub struct Connection {
    gateway: Arc<ConnectionGateway>,
    handle: ConnectionHandle,
    identity: Identity,
    room_id: RoomId,
    state: ConnectionState,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.handle.connection_id
    }

    /// Decode and dispatch one inbound frame. A frame that fails to decode
    /// closes this connection and is reported as `MalformedEnvelope`.
    pub async fn handle_frame(&mut self, frame: &str) -> Result<(), ServerError> {
        if self.state != ConnectionState::Active {
            return Err(ServerError::NotActive(self.state));
        }

        let event = match InboundEvent::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    room = %self.room_id,
                    user = %self.identity.user_id,
                    error = %e,
                    "Undecodable frame"
                );
                let reason = e.to_string();
                self.close(CloseReason::MalformedEnvelope(reason.clone()))
                    .await;
                return Err(ServerError::MalformedEnvelope(reason));
            }
        };

        debug!(room = %self.room_id, user = %self.identity.user_id, kind = event.kind(), "Inbound event");
        let ctx = RelayContext {
            room_id: self.room_id,
            identity: self.identity.clone(),
            reply: self.handle.clone(),
        };
        self.gateway.relay.dispatch(&ctx, event).await;
        Ok(())
    }

    /// Next item for the socket, with self-originated chatter filtered out.
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.recv().await? {
                Delivery::Event(event) if !event.is_visible_to(self.identity.user_id) => continue,
                other => return Some(other),
            }
        }
    }

    /// Run the Closing steps. Closing twice is a no-op.
    pub async fn close(&mut self, reason: CloseReason) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Closing;
        info!(
            room = %self.room_id,
            user = %self.identity.user_id,
            connection = %self.handle.connection_id,
            code = reason.code(),
            reason = reason.label(),
            "Closing connection"
        );

        if let Some(release) = self.spawn_release() {
            if let Err(e) = release.await {
                error!(connection = %self.handle.connection_id, error = %e, "Release task failed");
            }
        }
        self.state = ConnectionState::Closed;
    }

    fn spawn_release(&self) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(connection = %self.handle.connection_id, "Connection released outside a runtime");
            self.gateway.finished();
            return None;
        };

        let gateway = Arc::clone(&self.gateway);
        let handle = self.handle.clone();
        let identity = self.identity.clone();
        let room_id = self.room_id;
        Some(runtime.spawn(async move {
            gateway.release(&handle, &identity, room_id).await;
            gateway.finished();
        }))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.handle.connection_id)
            .field("user", &self.identity.user_id)
            .field("room", &self.room_id)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A `Closing` connection already has its release task running.
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        debug!(connection = %self.handle.connection_id, "Connection dropped without close");
        self.spawn_release();
    }
}
