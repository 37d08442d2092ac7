//! Signaling wire format
//!
//! Every frame on the WebSocket is a JSON object. Client messages share one
//! envelope shape:
//!
//! ```json
//! {"type": "offer", "from": "alice", "to": "bob", "payload": {"sdp": "..."}}
//! ```
//!
//! Only `join` and `leave` carry meaning for the server. Every other `type`
//! (`offer`, `answer`, `ice-candidate`, ...) is routed untouched.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Length of a room code
pub const ROOM_CODE_LEN: usize = 8;

/// Message type announcing a participant
pub const JOIN: &str = "join";
/// Message type announcing a departure
pub const LEAVE: &str = "leave";

/// What the server does with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Join,
    Leave,
    /// Offer, answer, ICE candidate or anything else; routed opaquely
    Signal,
}

/// A signaling message as exchanged over the socket
///
/// Fields the server does not know about are kept in `extra` and written
/// back out unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Build a `join` announcement for `user_id`
    pub fn join(user_id: impl Into<String>) -> Self {
        Self {
            kind: JOIN.to_string(),
            from: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// Classify the message
    pub fn message_kind(&self) -> MessageKind {
        match self.kind.as_str() {
            JOIN => MessageKind::Join,
            LEAVE => MessageKind::Leave,
            _ => MessageKind::Signal,
        }
    }

    /// The sender's user identifier: `from`, falling back to `userId`
    pub fn sender(&self) -> Option<&str> {
        non_empty(self.from.as_deref()).or_else(|| non_empty(self.user_id.as_deref()))
    }

    /// The target user identifier, if this is a directed message
    pub fn target(&self) -> Option<&str> {
        non_empty(self.to.as_deref())
    }

    pub fn is_directed(&self) -> bool {
        self.target().is_some()
    }
}

impl FromStr for Envelope {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Events originated by the server itself
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The other participants already in the room, sent to a joining client
    ParticipantsList { participants: Vec<String> },
    /// A participant left the room
    Leave {
        from: String,
        to: Option<String>,
        payload: Option<Value>,
    },
}

impl ServerEvent {
    pub fn participants_list(participants: Vec<String>) -> Self {
        Self::ParticipantsList { participants }
    }

    pub fn leave(from: impl Into<String>) -> Self {
        Self::Leave {
            from: from.into(),
            to: None,
            payload: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Generate a random room code from `[a-zA-Z0-9]`
pub fn generate_room_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_CODE_LEN)
        .map(char::from)
        .collect()
}

/// Whether `code` has the shape of a generated room code
pub fn is_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn room_codes_are_eight_alphanumerics() {
        for _ in 0..200 {
            let code = generate_room_code();
            assert!(is_room_code(&code), "bad room code {code:?}");
        }
    }

    #[test]
    fn rejects_malformed_room_codes() {
        assert!(is_room_code("aZ3kP9qT"));
        assert!(!is_room_code("aZ3kP9q"));
        assert!(!is_room_code("aZ3kP9qT1"));
        assert!(!is_room_code("aZ3k-9qT"));
        assert!(!is_room_code(""));
    }

    #[test]
    fn classifies_message_kinds() {
        let join: Envelope = r#"{"type":"join","userId":"alice"}"#.parse().unwrap();
        let leave: Envelope = r#"{"type":"leave","from":"alice"}"#.parse().unwrap();
        let ice: Envelope = r#"{"type":"ice-candidate","from":"alice"}"#.parse().unwrap();
        let custom: Envelope = r#"{"type":"mute"}"#.parse().unwrap();

        assert_eq!(join.message_kind(), MessageKind::Join);
        assert_eq!(leave.message_kind(), MessageKind::Leave);
        assert_eq!(ice.message_kind(), MessageKind::Signal);
        assert_eq!(custom.message_kind(), MessageKind::Signal);
    }

    #[test]
    fn sender_prefers_from_over_user_id() {
        let both: Envelope = r#"{"type":"join","from":"a","userId":"b"}"#.parse().unwrap();
        let only_user_id: Envelope = r#"{"type":"join","from":"","userId":"b"}"#.parse().unwrap();
        let neither: Envelope = r#"{"type":"join"}"#.parse().unwrap();

        assert_eq!(both.sender(), Some("a"));
        assert_eq!(only_user_id.sender(), Some("b"));
        assert_eq!(neither.sender(), None);
    }

    #[test]
    fn empty_or_null_target_is_undirected() {
        let null_to: Envelope = r#"{"type":"offer","to":null}"#.parse().unwrap();
        let empty_to: Envelope = r#"{"type":"offer","to":""}"#.parse().unwrap();
        let directed: Envelope = r#"{"type":"offer","to":"bob"}"#.parse().unwrap();

        assert!(!null_to.is_directed());
        assert!(!empty_to.is_directed());
        assert_eq!(directed.target(), Some("bob"));
    }

    #[test]
    fn unknown_fields_and_payload_survive_reserialization() {
        let raw = json!({
            "type": "offer",
            "from": "alice",
            "to": "bob",
            "payload": {"sdp": "v=0", "nested": [1, 2, 3]},
            "sessionId": 42
        });
        let envelope: Envelope = serde_json::from_value(raw.clone()).unwrap();
        let back: Value = serde_json::from_str(&envelope.to_string()).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn server_events_match_wire_shape() {
        let list = ServerEvent::participants_list(vec!["alice".into()]);
        assert_eq!(
            serde_json::from_str::<Value>(&list.to_json().unwrap()).unwrap(),
            json!({"type": "participants_list", "participants": ["alice"]})
        );

        let leave = ServerEvent::leave("bob");
        assert_eq!(
            serde_json::from_str::<Value>(&leave.to_json().unwrap()).unwrap(),
            json!({"type": "leave", "from": "bob", "to": null, "payload": null})
        );
    }

    #[test]
    fn rejects_envelope_without_type() {
        assert!(r#"{"from":"alice"}"#.parse::<Envelope>().is_err());
        assert!("not json".parse::<Envelope>().is_err());
    }
}
