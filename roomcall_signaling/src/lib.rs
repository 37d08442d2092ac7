//! WebSocket signaling relay for peer-to-peer video calls
//!
//! Clients in the same room exchange session negotiation messages through
//! this server. It does no media processing, only message routing and room
//! membership bookkeeping. Rooms live in memory and vanish with their last
//! participant.
//!
//! # Protocol
//!
//! - **GET /create-room** - Create a room: `{"roomID": "aZ3kP9qT"}`
//! - **GET /join-room?roomID={code}** - Open the signaling WebSocket
//! - **GET /health** - Health check
//!
//! ## Client → server
//!
//! JSON envelopes with `type`, `from`/`userId`, optional `to` and `payload`:
//! - `{"type": "join", "userId": "alice"}` - Enter the room
//! - `{"type": "leave", "from": "alice"}` - Leave the room
//! - `{"type": "offer", "from": "alice", "to": "bob", "payload": {...}}` - Any
//!   other type is routed as-is, to `to` if set, else to the rest of the room
//!
//! ## Server → client
//!
//! - `{"type": "participants_list", "participants": ["bob"]}` - Sent once after `join`
//! - `{"type": "join", "from": "carol", ...}` - Someone joined
//! - `{"type": "leave", "from": "carol", "to": null, "payload": null}` - Someone left
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! PORT=8080 roomcall-signaling
//!
//! # Create a room
//! curl http://127.0.0.1:8080/create-room
//!
//! # Join it
//! websocat "ws://127.0.0.1:8080/join-room?roomID=<code>"
//! ```

#![forbid(unsafe_code)]

pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod state;

pub use broadcaster::{Broadcaster, BroadcasterHandle};
pub use config::ServerConfig;
pub use error::SignalingError;
pub use handler::{AppState, router};
pub use state::{RoomId, RoomRegistry};
