//! Per-connection signaling protocol
//!
//! A [`Session`] is transport agnostic: the socket pump in
//! [`crate::handler`] feeds it text frames and closes the transport when it
//! reports [`Flow::Close`]. Everything it wants to send to its own client
//! goes through the connection's outbound queue.

use crate::broadcaster::{BroadcasterHandle, Outgoing};
use crate::connection::ConnectionHandle;
use crate::error::{ClientRequestError, SignalingError};
use crate::protocol::{Envelope, MessageKind};
use crate::state::{RoomId, RoomRegistry};
use tracing::{debug, info, warn};

/// Protocol state of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Upgraded but not yet checked against the registry
    Connecting,
    /// Reading messages. `user_id` is set once the client has sent `join`.
    Joined { user_id: Option<String> },
    Closed,
}

/// What the transport should do after a frame was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    room_id: RoomId,
    connection: ConnectionHandle,
    registry: RoomRegistry,
    broadcaster: BroadcasterHandle,
    state: SessionState,
}

impl Session {
    pub fn new(
        room_id: RoomId,
        connection: ConnectionHandle,
        registry: RoomRegistry,
        broadcaster: BroadcasterHandle,
    ) -> Self {
        Self {
            room_id,
            connection,
            registry,
            broadcaster,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Enter the protocol loop if the room exists
    pub fn open(&mut self) -> Result<(), SignalingError> {
        if self.state != SessionState::Connecting {
            return Ok(());
        }
        if !self.registry.contains(&self.room_id) {
            self.state = SessionState::Closed;
            return Err(SignalingError::RoomNotFound(self.room_id.clone()));
        }
        self.state = SessionState::Joined { user_id: None };
        Ok(())
    }

    /// Handle one text frame from the client
    pub async fn handle_text(&mut self, text: &str) -> Result<Flow, ClientRequestError> {
        if !matches!(self.state, SessionState::Joined { .. }) {
            return Err(ClientRequestError::Close);
        }
        let envelope: Envelope = text.parse()?;

        let flow = match envelope.message_kind() {
            MessageKind::Join => self.join(envelope).await,
            MessageKind::Leave => self.leave().await,
            MessageKind::Signal => self.publish(envelope).await,
        };

        Ok(flow.unwrap_or_else(|err| {
            warn!(room = %self.room_id, connection = %self.connection.id(), "Closing session: {err}");
            Flow::Close
        }))
    }

    async fn join(&mut self, mut envelope: Envelope) -> Result<Flow, SignalingError> {
        let Some(user_id) = envelope.sender().map(str::to_string) else {
            warn!(room = %self.room_id, "Ignoring join without a user id");
            return Ok(Flow::Continue);
        };
        if let SessionState::Joined { user_id: Some(existing) } = &self.state {
            warn!(room = %self.room_id, user = %existing, "Ignoring repeated join");
            return Ok(Flow::Continue);
        }

        let host = envelope.host.unwrap_or(false);
        self.registry.admit_participant(
            &self.room_id,
            host,
            user_id.clone(),
            self.connection.clone(),
        )?;
        self.state = SessionState::Joined {
            user_id: Some(user_id.clone()),
        };

        envelope.from = Some(user_id);
        self.publish(envelope).await
    }

    async fn publish(&self, envelope: Envelope) -> Result<Flow, SignalingError> {
        debug!(
            room = %self.room_id,
            connection = %self.connection.id(),
            kind = %envelope.kind,
            directed = envelope.is_directed(),
            "Publishing message"
        );
        self.broadcaster
            .publish(Outgoing::message(
                self.room_id.clone(),
                self.connection.id(),
                envelope,
            ))
            .await?;
        Ok(Flow::Continue)
    }

    async fn leave(&mut self) -> Result<Flow, SignalingError> {
        if let Some(notice) = self.depart() {
            self.broadcaster.publish(notice).await?;
        }
        Ok(Flow::Close)
    }

    /// Leave the room and close the connection. Safe to call repeatedly.
    ///
    /// The `leave` notice is queued behind everything this session already
    /// published, so peers see it last.
    pub fn close(&mut self) {
        if let Some(notice) = self.depart() {
            if let Err(err) = self.broadcaster.enqueue(notice) {
                warn!(room = %self.room_id, "Could not announce departure: {err}");
            }
        }
    }

    /// Detach from the registry and close the connection, returning the
    /// notice to route if the room has to be told
    fn depart(&mut self) -> Option<Outgoing> {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        self.connection.close();
        let SessionState::Joined { user_id: Some(user) } = previous else {
            return None;
        };

        info!(room = %self.room_id, user = %user, "Session closing");
        // Already gone when the broadcaster pruned us or the room was deleted.
        self.registry
            .detach_participant(&self.room_id, self.connection.id())?;
        Some(Outgoing::leave(self.room_id.clone(), self.connection.id(), user))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
