//! Topic membership and fan-out
//!
//! The hub keeps an explicit `topic -> viewers` map whose entries disappear as
//! soon as their last viewer leaves, so churned log targets do not pile up.
//! Each viewer owns a bounded outbound queue; `emit` fills those queues with
//! `try_send` and never waits, so one slow viewer cannot hold up a broadcast.
//!
//! The lock is never held across an `.await`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::protocol::{ServerMessage, update_frame};
use kubepulse_types::Topic;

/// Opaque identity of one connected viewer
pub type ViewerId = Uuid;

/// A serialized frame, shared by every viewer it is delivered to
pub type Frame = Arc<str>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("viewer {0} is not connected")]
    UnknownViewer(ViewerId),
}

/// The receiving half handed to the transport when a viewer connects
pub struct ViewerConnection {
    pub id: ViewerId,
    pub frames: mpsc::Receiver<Frame>,
}

struct ViewerEntry {
    sender: mpsc::Sender<Frame>,
    topics: HashSet<Topic>,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<Topic, HashSet<ViewerId>>,
    viewers: HashMap<ViewerId, ViewerEntry>,
}

impl HubState {
    fn remove_member(&mut self, topic: &Topic, viewer: &ViewerId) -> bool {
        let Some(members) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(viewer);
        if members.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }
}

/// Publish/subscribe hub shared by the transport and every producer
#[derive(Default)]
pub struct TopicHub {
    state: RwLock<HubState>,
    dropped: AtomicU64,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new viewer with an outbound queue of `capacity` frames
    pub fn connect(&self, capacity: usize) -> ViewerConnection {
        let (sender, frames) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();

        self.state.write().viewers.insert(
            id,
            ViewerEntry {
                sender,
                topics: HashSet::new(),
            },
        );

        ViewerConnection { id, frames }
    }

    /// Add a viewer to a topic. Returns false if it was already a member.
    pub fn join(&self, topic: Topic, viewer: ViewerId) -> Result<bool, HubError> {
        let mut state = self.state.write();
        let entry = state
            .viewers
            .get_mut(&viewer)
            .ok_or(HubError::UnknownViewer(viewer))?;

        if !entry.topics.insert(topic.clone()) {
            return Ok(false);
        }
        state.topics.entry(topic).or_default().insert(viewer);
        Ok(true)
    }

    /// Remove a viewer from a topic. Returns false if it was not a member.
    pub fn leave(&self, topic: &Topic, viewer: ViewerId) -> bool {
        let mut state = self.state.write();
        if let Some(entry) = state.viewers.get_mut(&viewer) {
            entry.topics.remove(topic);
        }
        state.remove_member(topic, &viewer)
    }

    /// Drop a viewer from every topic and forget it, in one locked step.
    /// Returns the number of topics it was removed from.
    pub fn leave_all(&self, viewer: ViewerId) -> usize {
        let mut state = self.state.write();
        let Some(entry) = state.viewers.remove(&viewer) else {
            return 0;
        };

        entry
            .topics
            .iter()
            .filter(|topic| state.remove_member(topic, &viewer))
            .count()
    }

    pub fn member_count(&self, topic: &Topic) -> usize {
        self.state.read().topics.get(topic).map_or(0, HashSet::len)
    }

    /// Targets of every `logs:<target>` topic that has at least one viewer
    pub fn log_targets(&self) -> BTreeSet<String> {
        self.state
            .read()
            .topics
            .keys()
            .filter_map(|topic| topic.log_target().map(str::to_string))
            .collect()
    }

    pub fn viewer_count(&self) -> usize {
        self.state.read().viewers.len()
    }

    /// Frames discarded because a viewer's queue was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Send `payload` to every member of `topic`.
    /// Returns how many viewers accepted the frame; 0 without members.
    pub fn emit<T: Serialize>(&self, topic: &Topic, payload: &T) -> usize {
        if self.member_count(topic) == 0 {
            return 0;
        }

        let frame = match update_frame(topic, payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(%topic, error = %e, "failed to serialize payload");
                return 0;
            }
        };

        let state = self.state.read();
        let Some(members) = state.topics.get(topic) else {
            return 0;
        };

        let mut delivered = 0;
        for viewer in members {
            let Some(entry) = state.viewers.get(viewer) else {
                continue;
            };
            if self.deliver(*viewer, entry, frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send a message to a single viewer (acknowledgements, errors)
    pub fn send_to(&self, viewer: ViewerId, message: &ServerMessage) -> bool {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(%viewer, error = %e, "failed to serialize message");
                return false;
            }
        };

        let state = self.state.read();
        state
            .viewers
            .get(&viewer)
            .is_some_and(|entry| self.deliver(viewer, entry, frame))
    }

    fn deliver(&self, viewer: ViewerId, entry: &ViewerEntry, frame: Frame) -> bool {
        match entry.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%viewer, "viewer queue full, frame dropped");
                false
            }
            // Transport already gone; its disconnect will clean up membership
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
