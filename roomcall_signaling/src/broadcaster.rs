//! Message routing
//!
//! A single task consumes one bounded queue shared by every room and
//! delivers each message in enqueue order. Directed messages go to the one
//! participant whose user id matches `to`; everything else fans out to the
//! room minus the sender. Departures announced by sessions travel through
//! the same queue, so peers never hear `leave` before messages the departing
//! client sent earlier. A failed delivery prunes that participant and the
//! loop moves on.

use crate::connection::ConnectionId;
use crate::error::SignalingError;
use crate::protocol::{Envelope, LEAVE, ServerEvent};
use crate::state::{Participant, RoomId, RoomRegistry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default capacity of the inbound routing queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What a queued item carries
#[derive(Debug, Clone)]
pub enum Event {
    /// A client message, relayed as received
    Message(Envelope),
    /// The sender left; the room is told with a `leave` notice
    Left(String),
}

/// A message waiting to be routed
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub room_id: RoomId,
    pub sender: ConnectionId,
    pub event: Event,
}

impl Outgoing {
    pub fn message(room_id: RoomId, sender: ConnectionId, envelope: Envelope) -> Self {
        Self {
            room_id,
            sender,
            event: Event::Message(envelope),
        }
    }

    pub fn leave(room_id: RoomId, sender: ConnectionId, user_id: impl Into<String>) -> Self {
        Self {
            room_id,
            sender,
            event: Event::Left(user_id.into()),
        }
    }
}

/// Outcome of routing one message
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub pruned: usize,
}

/// Producer side of the routing queue
#[derive(Debug, Clone)]
pub struct BroadcasterHandle {
    tx: mpsc::Sender<Outgoing>,
}

impl BroadcasterHandle {
    /// Enqueue a message for routing
    ///
    /// Waits while the queue is full, so a flooding connection is slowed
    /// down instead of having its messages dropped or reordered.
    pub async fn publish(&self, message: Outgoing) -> Result<(), SignalingError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SignalingError::BroadcasterStopped)
    }

    /// Enqueue a message without waiting
    ///
    /// For callers that cannot await, such as a session being dropped. When
    /// the queue is full the message is handed to a task that waits for room;
    /// everything the caller published before is already queued ahead of it.
    pub fn enqueue(&self, message: Outgoing) -> Result<(), SignalingError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| SignalingError::BroadcasterStopped)?;
                let tx = self.tx.clone();
                runtime.spawn(async move {
                    if tx.send(message).await.is_err() {
                        debug!("Broadcaster stopped before a queued message was sent");
                    }
                });
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(SignalingError::BroadcasterStopped),
        }
    }
}

/// The routing task
pub struct Broadcaster {
    registry: RoomRegistry,
    inbound: mpsc::Receiver<Outgoing>,
}

impl Broadcaster {
    pub fn new(registry: RoomRegistry, capacity: usize) -> (Self, BroadcasterHandle) {
        let (tx, inbound) = mpsc::channel(capacity);
        (Self { registry, inbound }, BroadcasterHandle { tx })
    }

    /// Start the routing task on the current runtime
    pub fn spawn(registry: RoomRegistry, capacity: usize) -> (BroadcasterHandle, JoinHandle<()>) {
        let (broadcaster, handle) = Self::new(registry, capacity);
        let task = tokio::spawn(broadcaster.run());
        (handle, task)
    }

    /// Route messages until every [`BroadcasterHandle`] is dropped
    pub async fn run(mut self) {
        info!("Broadcaster started");
        while let Some(message) = self.inbound.recv().await {
            self.route(message);
        }
        info!("Broadcaster stopped");
    }

    /// Deliver one message
    pub fn route(&self, message: Outgoing) -> Delivery {
        let Outgoing {
            room_id,
            sender,
            event,
        } = message;

        let (kind, json, target) = match &event {
            Event::Message(envelope) => (
                envelope.kind.as_str(),
                serde_json::to_string(envelope),
                envelope.target(),
            ),
            Event::Left(user_id) => (LEAVE, ServerEvent::leave(user_id.as_str()).to_json(), None),
        };

        let Some(participants) = self.registry.get(&room_id) else {
            debug!(room = %room_id, kind = %kind, "Room gone, dropping message");
            return Delivery::default();
        };

        let frame: Arc<str> = match json {
            Ok(json) => json.into(),
            Err(err) => {
                warn!(room = %room_id, "Failed to serialize message: {err}");
                return Delivery::default();
            }
        };

        let recipients: Vec<&Participant> = match target {
            Some(target) => {
                let found: Vec<_> = participants
                    .iter()
                    .filter(|p| p.user_id == target)
                    .take(1)
                    .collect();
                if found.is_empty() {
                    // No error goes back to the sender.
                    debug!(
                        room = %room_id,
                        kind = %kind,
                        to = target,
                        "Target not in room, dropping message"
                    );
                }
                found
            }
            None => participants
                .iter()
                .filter(|p| p.connection.id() != sender)
                .collect(),
        };

        let mut delivery = Delivery::default();
        for participant in recipients {
            match participant.connection.send(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(err) => {
                    warn!(
                        room = %room_id,
                        user = %participant.user_id,
                        "Delivery failed, dropping participant: {err}"
                    );
                    participant.connection.close();
                    self.registry
                        .remove_participant(&room_id, participant.connection.id());
                    delivery.pruned += 1;
                }
            }
        }
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, OutboundQueue};
    use serde_json::{Value, json};

    struct Room {
        registry: RoomRegistry,
        id: RoomId,
    }

    impl Room {
        fn new() -> Self {
            let registry = RoomRegistry::new();
            let id = registry.create_room();
            Self { registry, id }
        }

        fn join(&self, user: &str, capacity: usize) -> (ConnectionHandle, OutboundQueue) {
            let (conn, queue) = ConnectionHandle::new(capacity);
            self.registry
                .insert_participant(&self.id, false, user, conn.clone())
                .unwrap();
            (conn, queue)
        }

        fn message(&self, sender: &ConnectionHandle, raw: Value) -> Outgoing {
            Outgoing::message(self.id.clone(), sender.id(), serde_json::from_value(raw).unwrap())
        }
    }

    fn drain(queue: &mut OutboundQueue) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = queue.frames.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[test]
    fn undirected_message_skips_sender() {
        let room = Room::new();
        let (alice, mut qa) = room.join("alice", 8);
        let (_bob, mut qb) = room.join("bob", 8);
        let (_carol, mut qc) = room.join("carol", 8);
        let (broadcaster, _handle) = Broadcaster::new(room.registry.clone(), 8);

        let raw = json!({"type": "join", "from": "alice"});
        let delivery = broadcaster.route(room.message(&alice, raw.clone()));

        assert_eq!(delivery, Delivery { delivered: 2, pruned: 0 });
        assert!(drain(&mut qa).is_empty());
        assert_eq!(drain(&mut qb), vec![raw.clone()]);
        assert_eq!(drain(&mut qc), vec![raw]);
    }

    #[test]
    fn directed_message_reaches_only_target() {
        let room = Room::new();
        let (alice, mut qa) = room.join("alice", 8);
        let (_bob, mut qb) = room.join("bob", 8);
        let (_carol, mut qc) = room.join("carol", 8);
        let (broadcaster, _handle) = Broadcaster::new(room.registry.clone(), 8);

        let offer = json!({
            "type": "offer",
            "from": "alice",
            "to": "bob",
            "payload": {"sdp": "v=0"}
        });
        let delivery = broadcaster.route(room.message(&alice, offer.clone()));

        assert_eq!(delivery.delivered, 1);
        assert_eq!(drain(&mut qb), vec![offer]);
        assert!(drain(&mut qa).is_empty());
        assert!(drain(&mut qc).is_empty());
    }

    #[test]
    fn directed_message_to_unknown_target_is_silently_dropped() {
        let room = Room::new();
        let (alice, mut qa) = room.join("alice", 8);
        let (_bob, mut qb) = room.join("bob", 8);
        let (broadcaster, _handle) = Broadcaster::new(room.registry.clone(), 8);

        let raw = json!({"type": "answer", "from": "alice", "to": "mallory"});
        let delivery = broadcaster.route(room.message(&alice, raw));

        assert_eq!(delivery, Delivery::default());
        assert!(drain(&mut qa).is_empty());
        assert!(drain(&mut qb).is_empty());
    }

    #[test]
    fn message_for_missing_room_is_dropped() {
        let registry = RoomRegistry::new();
        let (broadcaster, _handle) = Broadcaster::new(registry, 8);
        let (conn, _queue) = ConnectionHandle::new(1);

        let delivery = broadcaster.route(Outgoing::message(
            RoomId::from("missing1"),
            conn.id(),
            Envelope::join("alice"),
        ));
        assert_eq!(delivery, Delivery::default());
    }

    #[test]
    fn failed_write_prunes_peer_and_keeps_delivering() {
        let room = Room::new();
        let (alice, mut qa) = room.join("alice", 8);
        let (bob, qb) = room.join("bob", 8);
        let (_carol, mut qc) = room.join("carol", 8);
        drop(qb);
        let (broadcaster, _handle) = Broadcaster::new(room.registry.clone(), 8);

        let raw = json!({"type": "ice-candidate", "from": "alice", "payload": {"candidate": "x"}});
        let delivery = broadcaster.route(room.message(&alice, raw.clone()));

        assert_eq!(delivery, Delivery { delivered: 1, pruned: 1 });
        assert!(bob.is_closed());
        let users: Vec<_> = room
            .registry
            .get(&room.id)
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(users, vec!["alice", "carol"]);

        // Remaining members hear about the pruned peer.
        let leave = json!({"type": "leave", "from": "bob", "to": null, "payload": null});
        assert_eq!(drain(&mut qa), vec![leave.clone()]);
        let carol_frames = drain(&mut qc);
        assert!(carol_frames.contains(&raw));
        assert!(carol_frames.contains(&leave));
    }

    #[test]
    fn full_outbound_queue_counts_as_disconnect() {
        let room = Room::new();
        let (alice, _qa) = room.join("alice", 8);
        let (bob, _qb) = room.join("bob", 1);
        bob.send("backlog".into()).unwrap();
        let (broadcaster, _handle) = Broadcaster::new(room.registry.clone(), 8);

        let delivery =
            broadcaster.route(room.message(&alice, json!({"type": "offer", "to": "bob"})));

        assert_eq!(delivery.pruned, 1);
        assert_eq!(room.registry.participant_count(&room.id), Some(1));
    }

    #[test]
    fn departure_is_announced_to_the_rest_of_the_room() {
        let room = Room::new();
        let (_alice, mut qa) = room.join("alice", 8);
        let (bob, _qb) = room.join("bob", 8);
        let (_carol, mut qc) = room.join("carol", 8);
        room.registry.detach_participant(&room.id, bob.id());
        let (broadcaster, _handle) = Broadcaster::new(room.registry.clone(), 8);

        let delivery = broadcaster.route(Outgoing::leave(room.id.clone(), bob.id(), "bob"));

        let leave = json!({"type": "leave", "from": "bob", "to": null, "payload": null});
        assert_eq!(delivery, Delivery { delivered: 2, pruned: 0 });
        assert_eq!(drain(&mut qa), vec![leave.clone()]);
        assert_eq!(drain(&mut qc), vec![leave]);
    }

    #[tokio::test]
    async fn leave_is_routed_after_earlier_messages_from_the_same_sender() {
        let room = Room::new();
        let (_alice, mut qa) = room.join("alice", 8);
        let (bob, _qb) = room.join("bob", 8);
        let (handle, task) = Broadcaster::spawn(room.registry.clone(), 1);

        handle
            .publish(room.message(&bob, json!({"type": "join", "from": "bob"})))
            .await
            .unwrap();
        handle
            .publish(room.message(&bob, json!({"type": "offer", "from": "bob", "to": "alice"})))
            .await
            .unwrap();
        room.registry.detach_participant(&room.id, bob.id());
        // The offer may still occupy the only slot, sending the leave through a task.
        handle
            .enqueue(Outgoing::leave(room.id.clone(), bob.id(), "bob"))
            .unwrap();
        drop(handle);
        task.await.unwrap();

        let kinds: Vec<_> = drain(&mut qa).iter().map(|v| v["type"].clone()).collect();
        assert_eq!(kinds, vec![json!("join"), json!("offer"), json!("leave")]);
    }

    #[tokio::test]
    async fn run_preserves_enqueue_order() {
        let room = Room::new();
        let (alice, _qa) = room.join("alice", 8);
        let (_bob, mut qb) = room.join("bob", 8);
        let (handle, task) = Broadcaster::spawn(room.registry.clone(), 2);

        for seq in 0..5 {
            handle
                .publish(room.message(&alice, json!({"type": "offer", "to": "bob", "seq": seq})))
                .await
                .unwrap();
        }
        drop(handle);
        task.await.unwrap();

        let seqs: Vec<_> = drain(&mut qb).iter().map(|v| v["seq"].clone()).collect();
        assert_eq!(seqs, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn publish_fails_once_broadcaster_is_gone() {
        let (broadcaster, handle) = Broadcaster::new(RoomRegistry::new(), 1);
        drop(broadcaster);
        let (conn, _queue) = ConnectionHandle::new(1);

        let result = handle
            .publish(Outgoing::message(
                RoomId::from("missing1"),
                conn.id(),
                Envelope::join("alice"),
            ))
            .await;
        assert!(matches!(result, Err(SignalingError::BroadcasterStopped)));

        let result = handle.enqueue(Outgoing::leave(RoomId::from("missing1"), conn.id(), "alice"));
        assert!(matches!(result, Err(SignalingError::BroadcasterStopped)));
    }
}
