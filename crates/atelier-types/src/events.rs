use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{WireMessage, WirePatch};

/// Change-feed events pushed to thread subscribers over the WebSocket feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChangeEvent {
    /// A message row was created.
    Insert { message: WireMessage },

    /// A message row changed. Carries every mutable field the server knows.
    Update { thread_id: Uuid, patch: WirePatch },
}

impl ChangeEvent {
    /// Every change event is scoped to exactly one thread.
    pub fn thread_id(&self) -> Uuid {
        match self {
            Self::Insert { message } => message.thread_id,
            Self::Update { thread_id, .. } => *thread_id,
        }
    }

    pub fn message_id(&self) -> Uuid {
        match self {
            Self::Insert { message } => message.id,
            Self::Update { patch, .. } => patch.id,
        }
    }
}
