//! Error types for the signaling relay

use crate::connection::ConnectionId;
use crate::state::RoomId;
use thiserror::Error;

/// Errors that can occur while relaying signaling messages
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The room does not exist (never created, or already deleted)
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// The connection already has a participant in this room
    #[error("Connection {0} already joined room {1}")]
    AlreadyJoined(ConnectionId, RoomId),

    /// The connection's outbound queue is full
    #[error("Outbound queue full for connection {0}")]
    OutboundFull(ConnectionId),

    /// The connection has been closed
    #[error("Connection {0} closed")]
    ConnectionClosed(ConnectionId),

    /// The broadcaster task is no longer running
    #[error("Broadcaster stopped")]
    BroadcasterStopped,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from client messages
#[derive(Error, Debug)]
pub enum ClientRequestError {
    /// Connection was closed
    #[error("Connection closed")]
    Close,

    /// Message was not a valid signaling envelope
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Unsupported frame type
    #[error("Unsupported frame type")]
    UnsupportedType,
}
