//! Topic fan-out for kubepulse
//!
//! This crate tracks which viewers are subscribed to which topics, delivers
//! payloads to them without ever waiting on a slow viewer, and exposes the
//! hub to browsers over WebSocket.

mod hub;
mod protocol;
mod websocket;

pub use hub::{Frame, HubError, TopicHub, ViewerConnection, ViewerId};
pub use protocol::{ClientMessage, ServerMessage};
pub use websocket::{handle_text, serve};

// Re-export types used in our public API
pub use kubepulse_types::Topic;
