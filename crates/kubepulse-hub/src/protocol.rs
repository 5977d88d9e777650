//! Viewer wire protocol
//!
//! Every frame is a JSON object tagged by `type`. Viewers only ever send
//! subscribe/unsubscribe; the core answers with acknowledgements, errors and
//! topic updates.

use serde::{Deserialize, Serialize};

use crate::hub::Frame;
use kubepulse_types::Topic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Topic is kept as text so an unknown topic gets a precise error
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed { topic: Topic },
    Unsubscribed { topic: Topic },
    Update { topic: Topic, data: serde_json::Value },
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub(crate) fn to_frame(&self) -> serde_json::Result<Frame> {
        serde_json::to_string(self).map(Frame::from)
    }
}

/// Borrowed twin of `ServerMessage::Update` so payloads serialize straight to text
#[derive(Serialize)]
struct UpdateFrame<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    topic: &'a Topic,
    data: &'a T,
}

pub(crate) fn update_frame<T: Serialize>(topic: &Topic, data: &T) -> serde_json::Result<Frame> {
    serde_json::to_string(&UpdateFrame {
        kind: "update",
        topic,
        data,
    })
    .map(Frame::from)
}
