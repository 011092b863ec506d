use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = Uuid;
pub type ThreadId = Uuid;
pub type MessageId = Uuid;

/// Content shown in place of a soft-deleted message.
pub const TOMBSTONE_CONTENT: &str = "This message was deleted.";

/// A conversation attached to one sculpture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub topic: String,
    pub participant_ids: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub reaction: String,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Position of a message in the total order: `created_at` first, then `id`.
///
/// Doubles as the backward pagination cursor (the key of the oldest message
/// of a page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub created_at: DateTime<Utc>,
    pub id: MessageId,
}

pub type Cursor = SortKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub author_id: UserId,
    pub created_at: DateTime<Utc>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<Reaction>,
    pub edited_at: Option<DateTime<Utc>>,
    pub tombstoned: bool,
}

impl Message {
    pub fn sort_key(&self) -> SortKey {
        SortKey {
            created_at: self.created_at,
            id: self.id,
        }
    }

    /// Soft-delete in place. Identity, timestamp and author survive.
    pub fn tombstone(&mut self) {
        self.content = TOMBSTONE_CONTENT.to_string();
        self.attachments.clear();
        self.tombstoned = true;
    }

    /// Apply a field patch. Returns whether anything changed.
    ///
    /// Tombstones are sticky: a patch can set one but never clear it, and
    /// content/attachments of a tombstoned message stay cleared.
    pub fn apply_patch(&mut self, patch: &MessagePatch) -> bool {
        let before = self.clone();

        if !self.tombstoned {
            if let Some(content) = &patch.content {
                self.content.clone_from(content);
            }
            if let Some(attachments) = &patch.attachments {
                self.attachments.clone_from(attachments);
            }
        }
        if let Some(reactions) = &patch.reactions {
            self.reactions = dedupe_reactions(reactions.clone());
        }
        if patch.edited_at.is_some() {
            self.edited_at = patch.edited_at;
        }
        if patch.tombstoned == Some(true) {
            self.tombstone();
        }

        *self != before
    }

    pub fn has_reaction(&self, kind: &str, user_id: UserId) -> bool {
        self.reactions
            .iter()
            .any(|r| r.reaction == kind && r.user_id == user_id)
    }
}

/// Partial update of a message. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub id: MessageId,
    pub content: Option<String>,
    pub attachments: Option<Vec<Attachment>>,
    pub reactions: Option<Vec<Reaction>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub tombstoned: Option<bool>,
}

impl MessagePatch {
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Patch carrying every mutable field of `message`.
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id,
            content: Some(message.content.clone()),
            attachments: Some(message.attachments.clone()),
            reactions: Some(message.reactions.clone()),
            edited_at: message.edited_at,
            tombstoned: Some(message.tombstoned),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.attachments.is_none()
            && self.reactions.is_none()
            && self.edited_at.is_none()
            && self.tombstoned.is_none()
    }
}

/// One fetch worth of history, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub messages: Vec<Message>,
    /// The page size that was requested, used to detect the end of history.
    pub limit: u32,
}

impl Page {
    /// Cursor for the next older page: the key of the oldest message.
    pub fn cursor(&self) -> Option<Cursor> {
        self.messages.iter().map(Message::sort_key).min()
    }

    /// A full page means older history may exist. A short one ends it.
    pub fn is_full(&self) -> bool {
        self.messages.len() as u64 == u64::from(self.limit)
    }
}

/// Drop repeated `(reaction, user_id)` pairs, keeping the first occurrence.
pub fn dedupe_reactions(reactions: Vec<Reaction>) -> Vec<Reaction> {
    let mut seen = BTreeSet::new();
    reactions
        .into_iter()
        .filter(|r| seen.insert((r.reaction.clone(), r.user_id)))
        .collect()
}

/// Toggle `kind` for `user_id`: remove it when present, append it otherwise.
pub fn toggle_reaction(
    reactions: &[Reaction],
    kind: &str,
    user_id: UserId,
    username: Option<&str>,
) -> Vec<Reaction> {
    let present = reactions
        .iter()
        .any(|r| r.reaction == kind && r.user_id == user_id);

    if present {
        reactions
            .iter()
            .filter(|r| !(r.reaction == kind && r.user_id == user_id))
            .cloned()
            .collect()
    } else {
        let mut next = reactions.to_vec();
        next.push(Reaction {
            reaction: kind.to_string(),
            user_id,
            username: username.map(str::to_string),
        });
        next
    }
}
