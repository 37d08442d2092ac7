//! Per-connection outbound path
//!
//! Each live connection owns its socket and is the only task writing to it.
//! Everyone else (the session at join time, the broadcaster, the registry
//! sending `leave` notices) pushes serialized frames into the connection's
//! bounded queue through a cloned [`ConnectionHandle`].

use crate::error::SignalingError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cloneable write side of a connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    frames: mpsc::Sender<Arc<str>>,
    closed: Arc<watch::Sender<bool>>,
}

/// Read side of a connection's outbound path, held by the task owning the socket
#[derive(Debug)]
pub struct OutboundQueue {
    pub frames: mpsc::Receiver<Arc<str>>,
    pub closed: watch::Receiver<bool>,
}

impl ConnectionHandle {
    /// Create a handle with room for `capacity` undelivered frames
    pub fn new(capacity: usize) -> (Self, OutboundQueue) {
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = Self {
            id: ConnectionId::next(),
            frames: frames_tx,
            closed: Arc::new(closed_tx),
        };
        let queue = OutboundQueue {
            frames: frames_rx,
            closed: closed_rx,
        };
        (handle, queue)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame for delivery without waiting
    ///
    /// A full queue counts as a failed write, same as a closed connection.
    pub fn send(&self, frame: Arc<str>) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::ConnectionClosed(self.id));
        }
        self.frames.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SignalingError::OutboundFull(self.id),
            mpsc::error::TrySendError::Closed(_) => SignalingError::ConnectionClosed(self.id),
        })
    }

    /// Ask the owning task to close the transport. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.frames.is_closed()
    }
}

/// Resolve once the connection has been asked to close
pub async fn closed(signal: &mut watch::Receiver<bool>) {
    loop {
        let closed = *signal.borrow_and_update();
        if closed || signal.changed().await.is_err() {
            return;
        }
    }
}
