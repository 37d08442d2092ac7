//! Room registry
//!
//! Owns the mapping from room code to the participants connected to it.
//! Mutations take the write lock for their whole duration, so readers never
//! observe a half-applied membership change. No lock is ever held across an
//! `.await`; the only I/O done under the lock is non-blocking queue pushes.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::SignalingError;
use crate::protocol::{ServerEvent, generate_room_code};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Room identifier
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique identifier assigned to each participant on insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(pub Uuid);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One connected client's membership in a room
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub user_id: String,
    pub host: bool,
    pub connection: ConnectionHandle,
}

/// Shared handle to the room registry
///
/// Constructed once at startup and cloned into every connection handler.
#[derive(Debug, Default, Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<RoomId, Vec<Participant>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RoomId, Vec<Participant>>> {
        self.rooms.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RoomId, Vec<Participant>>> {
        self.rooms.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a room under a fresh random code
    pub fn create_room(&self) -> RoomId {
        self.create_room_with(generate_room_code)
    }

    /// Create a room, drawing codes from `next_code` until one is unused
    pub fn create_room_with(&self, mut next_code: impl FnMut() -> String) -> RoomId {
        let mut rooms = self.write();
        let room_id = loop {
            let candidate = RoomId(next_code());
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
            debug!(room = %candidate, "Room code collision, regenerating");
        };
        rooms.insert(room_id.clone(), Vec::new());
        info!(room = %room_id, "Room created");
        room_id
    }

    /// Snapshot of a room's participants, `None` if the room does not exist
    pub fn get(&self, room_id: &RoomId) -> Option<Vec<Participant>> {
        self.read().get(room_id).cloned()
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.read().contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.read().len()
    }

    /// Number of participants in a room, `None` if the room does not exist
    pub fn participant_count(&self, room_id: &RoomId) -> Option<usize> {
        self.read().get(room_id).map(Vec::len)
    }

    /// Add a participant for `connection` to an existing room
    pub fn insert_participant(
        &self,
        room_id: &RoomId,
        host: bool,
        user_id: impl Into<String>,
        connection: ConnectionHandle,
    ) -> Result<ParticipantId, SignalingError> {
        let mut rooms = self.write();
        Self::insert_locked(&mut rooms, room_id, host, user_id.into(), connection)
    }

    /// Insert a participant and queue it the list of everyone already present
    ///
    /// The list is queued before the write lock is released, so it is the
    /// first frame the new participant sees, ahead of any routed message.
    pub fn admit_participant(
        &self,
        room_id: &RoomId,
        host: bool,
        user_id: impl Into<String>,
        connection: ConnectionHandle,
    ) -> Result<ParticipantId, SignalingError> {
        let mut rooms = self.write();
        let others: Vec<String> = rooms
            .get(room_id)
            .map(|participants| participants.iter().map(|p| p.user_id.clone()).collect())
            .unwrap_or_default();
        let list = ServerEvent::participants_list(others).to_json()?;

        let id = Self::insert_locked(&mut rooms, room_id, host, user_id.into(), connection.clone())?;
        if let Err(err) = connection.send(list.into()) {
            if let Some(participants) = rooms.get_mut(room_id) {
                participants.retain(|p| p.id != id);
            }
            return Err(err);
        }
        Ok(id)
    }

    fn insert_locked(
        rooms: &mut HashMap<RoomId, Vec<Participant>>,
        room_id: &RoomId,
        host: bool,
        user_id: String,
        connection: ConnectionHandle,
    ) -> Result<ParticipantId, SignalingError> {
        let participants = rooms
            .get_mut(room_id)
            .ok_or_else(|| SignalingError::RoomNotFound(room_id.clone()))?;

        if participants
            .iter()
            .any(|p| p.connection.id() == connection.id())
        {
            return Err(SignalingError::AlreadyJoined(
                connection.id(),
                room_id.clone(),
            ));
        }

        let participant = Participant {
            id: ParticipantId(Uuid::new_v4()),
            user_id,
            host,
            connection,
        };
        let id = participant.id;
        info!(
            room = %room_id,
            participant = %id,
            user = %participant.user_id,
            host,
            "Participant joined"
        );
        participants.push(participant);
        Ok(id)
    }

    /// Remove the participant using `connection` and tell the rest of the room
    ///
    /// Used by the broadcaster when it drops a peer it could not deliver to.
    /// The notice is pushed straight into the remaining outbound queues, which
    /// keeps it in order because the broadcaster is the only other writer.
    pub fn remove_participant(
        &self,
        room_id: &RoomId,
        connection: ConnectionId,
    ) -> Option<Participant> {
        let mut rooms = self.write();
        let leaving = Self::detach_locked(&mut rooms, room_id, connection)?;
        let Some(participants) = rooms.get(room_id) else {
            return Some(leaving);
        };

        match ServerEvent::leave(leaving.user_id.clone()).to_json() {
            Ok(json) => {
                let frame: Arc<str> = json.into();
                for participant in participants {
                    if let Err(err) = participant.connection.send(frame.clone()) {
                        warn!(
                            room = %room_id,
                            user = %participant.user_id,
                            "Failed to deliver leave notice: {err}"
                        );
                    }
                }
            }
            Err(err) => warn!("Failed to serialize leave notice: {err}"),
        }

        Some(leaving)
    }

    /// Remove the participant using `connection` without notifying anyone
    ///
    /// Closes its connection and deletes the room when it becomes empty.
    /// Sessions use this and announce the departure through the broadcaster
    /// queue instead. Removing an unknown participant is a no-op.
    pub fn detach_participant(
        &self,
        room_id: &RoomId,
        connection: ConnectionId,
    ) -> Option<Participant> {
        Self::detach_locked(&mut self.write(), room_id, connection)
    }

    fn detach_locked(
        rooms: &mut HashMap<RoomId, Vec<Participant>>,
        room_id: &RoomId,
        connection: ConnectionId,
    ) -> Option<Participant> {
        let participants = rooms.get_mut(room_id)?;
        let index = participants
            .iter()
            .position(|p| p.connection.id() == connection)?;

        let leaving = participants.remove(index);
        leaving.connection.close();
        info!(
            room = %room_id,
            participant = %leaving.id,
            user = %leaving.user_id,
            "Participant left"
        );

        if participants.is_empty() {
            rooms.remove(room_id);
            info!(room = %room_id, "Room empty, deleted");
        }
        Some(leaving)
    }

    /// Remove a room unconditionally, closing every remaining connection
    pub fn delete_room(&self, room_id: &RoomId) {
        if let Some(participants) = self.write().remove(room_id) {
            for participant in &participants {
                participant.connection.close();
            }
            info!(
                room = %room_id,
                closed = participants.len(),
                "Room deleted"
            );
        }
    }
}
