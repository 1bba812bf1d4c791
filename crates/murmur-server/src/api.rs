use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, Method},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use murmur_shared::constants::{APP_NAME, PROTOCOL_VERSION};
use murmur_shared::RoomId;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::broker::{BrokerStatsSnapshot, Delivery, RoomBroker};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::file_store::DiskFileStore;
use crate::gateway::{CloseReason, Connection, ConnectionGateway};
use crate::presence::PresenceRegistry;
use crate::relay::{MessageRelay, RelayStatsSnapshot};
use crate::services::FileStoreError;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ConnectionGateway>,
    pub presence: Arc<PresenceRegistry>,
    pub broker: Arc<RoomBroker>,
    pub relay: Arc<MessageRelay>,
    pub files: Arc<DiskFileStore>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws/chat/:room_id", get(chat_socket))
        .route("/uploads/:name", get(download_upload))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    app: &'static str,
    name: String,
    version: &'static str,
    protocol: &'static str,
    connected_users: usize,
    active_rooms: usize,
    relay: RelayStatsSnapshot,
    broker: BrokerStatsSnapshot,
}

#[derive(Deserialize)]
struct SocketQuery {
    #[serde(default)]
    token: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        app: APP_NAME,
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        connected_users: state.presence.len().await,
        active_rooms: state.broker.room_count(),
        relay: state.relay.stats(),
        broker: state.broker.stats(),
    })
}

/// Authenticate and admit before accepting the upgrade, so refusals are
/// plain HTTP errors.
async fn chat_socket(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let room_id = RoomId(room_id);
    let connection = state.gateway.connect(&query.token, room_id).await?;
    let idle_timeout = state.config.idle_timeout;

    Ok(ws
        .max_message_size(state.config.max_frame_size)
        .max_frame_size(state.config.max_frame_size)
        .on_upgrade(move |socket| run_connection(socket, connection, idle_timeout)))
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn run_connection(socket: WebSocket, mut connection: Connection, idle_timeout: Option<Duration>) {
    let (mut sink, mut stream) = socket.split();

    let reason = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = connection.handle_frame(&text).await {
                        break close_reason_for(e);
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if let Err(e) = connection.handle_frame(&text).await {
                            break close_reason_for(e);
                        }
                    }
                    Err(_) => {
                        break CloseReason::MalformedEnvelope("binary frame is not UTF-8".into())
                    }
                },
                Some(Ok(Message::Close(_))) | None => break CloseReason::Normal,
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseReason::Transport(e.to_string()),
            },
            delivery = connection.next_delivery() => match delivery {
                Some(Delivery::Event(event)) => match event.to_json() {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            break CloseReason::Transport(e.to_string());
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode outbound event"),
                },
                Some(Delivery::Close(reason)) => break reason,
                None => break CloseReason::RoomLost,
            },
            _ = idle(idle_timeout) => break CloseReason::IdleTimeout,
        }
    };

    connection.close(reason.clone()).await;

    if reason.sends_frame() {
        let frame = CloseFrame {
            code: reason.code(),
            reason: reason.label().into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Close frame not delivered");
        }
    }
    info!(
        room = %connection.room_id(),
        user = %connection.identity().user_id,
        connection = %connection.connection_id(),
        code = reason.code(),
        "Chat socket finished"
    );
}

fn close_reason_for(error: ServerError) -> CloseReason {
    match error {
        ServerError::MalformedEnvelope(reason) => CloseReason::MalformedEnvelope(reason),
        ServerError::NotActive(_) => CloseReason::Normal,
        other => CloseReason::Transport(other.to_string()),
    }
}

async fn download_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ServerError> {
    match state.files.open(&name).await {
        Ok(Some(data)) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response()),
        Ok(None) => Err(ServerError::NotFound(name)),
        Err(FileStoreError::Rejected(reason)) => Err(ServerError::BadRequest(reason)),
        Err(e) => Err(e.into()),
    }
}

/// How long shutdown waits for open sockets to finish their Closing steps.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Close every socket with 1001, wait for their Closing steps, then drain
/// the persistence outbox. Returns the number of connections told to close.
pub async fn shutdown(state: &AppState, grace: Duration) -> usize {
    let closed = state.broker.dissolve_all(CloseReason::ServerShutdown).await;
    if !state.gateway.wait_until_drained(grace).await {
        warn!(
            remaining = state.gateway.live_connections(),
            "Connections still closing after the shutdown grace period"
        );
    }
    state.relay.flush().await;
    closed
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}

pub async fn serve_on(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
