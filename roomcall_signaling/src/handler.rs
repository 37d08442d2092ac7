//! HTTP and WebSocket handlers
//!
//! - **GET /create-room** - Create a room, returns `{"roomID": "<code>"}`
//! - **GET /join-room?roomID={code}** - Upgrade to a signaling WebSocket
//! - **GET /health** - Health check

use crate::broadcaster::{Broadcaster, BroadcasterHandle};
use crate::config::ServerConfig;
use crate::connection::{self, ConnectionHandle};
use crate::error::ClientRequestError;
use crate::session::{Flow, Session};
use crate::state::{RoomId, RoomRegistry};
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// State shared by every request
#[derive(Clone)]
pub struct AppState {
    pub registry: RoomRegistry,
    pub broadcaster: BroadcasterHandle,
    pub outbound_capacity: usize,
}

impl AppState {
    /// Build the registry and start the broadcaster task
    pub fn new(config: &ServerConfig) -> Self {
        let registry = RoomRegistry::new();
        let (broadcaster, _task) =
            Broadcaster::spawn(registry.clone(), config.relay.inbound_queue_capacity);
        Self {
            registry,
            broadcaster,
            outbound_capacity: config.relay.outbound_queue_capacity,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateRoomResponse {
    #[serde(rename = "roomID")]
    room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    #[serde(rename = "roomID")]
    room_id: Option<String>,
}

/// Build the application router
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/create-room", get(create_room))
        .route("/join-room", get(join_room))
        .route("/health", get(health))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn create_room(State(state): State<AppState>) -> Json<CreateRoomResponse> {
    let room_id = state.registry.create_room();
    Json(CreateRoomResponse { room_id: room_id.0 })
}

async fn join_room(
    State(state): State<AppState>,
    Query(params): Query<JoinParams>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(room_id) = params.room_id.filter(|id| !id.is_empty()) else {
        info!("roomID is missing, unable to join the call");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "roomID is required" })),
        )
            .into_response();
    };
    let Some(ws) = ws else {
        return StatusCode::UPGRADE_REQUIRED.into_response();
    };

    let room_id = RoomId(room_id);
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, state))
}

/// Drive one upgraded connection until it closes
///
/// This task is the only writer to the socket. It forwards frames queued on
/// the connection's handle and feeds inbound frames to the session.
pub async fn handle_socket(socket: WebSocket, room_id: RoomId, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (connection, queue) = ConnectionHandle::new(state.outbound_capacity);
    let connection_id = connection.id();
    let mut session = Session::new(
        room_id.clone(),
        connection,
        state.registry,
        state.broadcaster,
    );

    if let Err(err) = session.open() {
        info!(room = %room_id, connection = %connection_id, "Rejecting connection: {err}");
        let _ = sink.send(Message::Close(None)).await;
        return;
    }
    info!(room = %room_id, connection = %connection_id, "New WebSocket connection");

    let mut frames = queue.frames;
    let mut closed = queue.closed;

    loop {
        tokio::select! {
            _ = connection::closed(&mut closed) => {
                debug!(connection = %connection_id, "Connection closed by server");
                break;
            }
            Some(frame) = frames.recv() => {
                if let Err(err) = sink.send(Message::Text(frame.to_string())).await {
                    warn!(connection = %connection_id, "Write error: {err}");
                    break;
                }
            }
            inbound = stream.next() => {
                let flow = match inbound {
                    Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                    Some(Ok(Message::Binary(_))) => Err(ClientRequestError::UnsupportedType),
                    Some(Ok(Message::Close(_))) | None => Err(ClientRequestError::Close),
                    Some(Ok(_)) => Ok(Flow::Continue),
                    Some(Err(err)) => {
                        warn!(room = %room_id, connection = %connection_id, "Read error: {err}");
                        Err(ClientRequestError::Close)
                    }
                };
                match flow {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break,
                    Err(ClientRequestError::Close) => break,
                    Err(err) => {
                        warn!(room = %room_id, connection = %connection_id, "Read error: {err}");
                        break;
                    }
                }
            }
        }
    }

    session.close();
    let _ = sink.send(Message::Close(None)).await;
    info!(room = %room_id, connection = %connection_id, "WebSocket connection closed");
}
