use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::models::{Attachment, Cursor, Message, MessagePatch, Reaction};

// -- Wire records --
//
// Attachments and reactions travel as raw JSON and are only trusted after
// passing through `crate::validate`.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub reactions: Vec<Value>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tombstoned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePatch {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstoned: Option<bool>,
}

pub fn attachment_value(attachment: &Attachment) -> Value {
    json!({
        "name": attachment.name,
        "url": attachment.url,
        "type": attachment.kind,
        "size": attachment.size,
    })
}

pub fn reaction_value(reaction: &Reaction) -> Value {
    match &reaction.username {
        Some(username) => json!({
            "reaction": reaction.reaction,
            "user_id": reaction.user_id,
            "username": username,
        }),
        None => json!({
            "reaction": reaction.reaction,
            "user_id": reaction.user_id,
        }),
    }
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            thread_id: m.thread_id,
            author_id: m.author_id,
            created_at: m.created_at,
            content: m.content.clone(),
            attachments: m.attachments.iter().map(attachment_value).collect(),
            reactions: m.reactions.iter().map(reaction_value).collect(),
            edited_at: m.edited_at,
            tombstoned: m.tombstoned,
        }
    }
}

impl From<&MessagePatch> for WirePatch {
    fn from(p: &MessagePatch) -> Self {
        Self {
            id: p.id,
            content: p.content.clone(),
            attachments: p
                .attachments
                .as_ref()
                .map(|a| a.iter().map(attachment_value).collect()),
            reactions: p
                .reactions
                .as_ref()
                .map(|r| r.iter().map(reaction_value).collect()),
            edited_at: p.edited_at,
            tombstoned: p.tombstoned,
        }
    }
}

// -- Messages --

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// `created_at` of the oldest message of the previous page.
    pub before: Option<DateTime<Utc>>,
    /// `id` of that same message; breaks ties between equal timestamps.
    pub before_id: Option<Uuid>,
}

pub fn default_limit() -> u32 {
    50
}

impl PageQuery {
    pub fn cursor(&self) -> Option<Cursor> {
        match (self.before, self.before_id) {
            (Some(created_at), Some(id)) => Some(Cursor { created_at, id }),
            // Without an id every message at `before` is older-or-equal; the
            // max id keeps them all.
            (Some(created_at), None) => Some(Cursor {
                created_at,
                id: Uuid::from_u128(u128::MAX),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResponse {
    /// Oldest first.
    pub messages: Vec<WireMessage>,
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Value>,
}

/// Body of `PATCH /messages/{id}`. The server stamps `edited_at` itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstoned: Option<bool>,
}

impl UpdateMessageRequest {
    pub fn into_patch(self, id: Uuid) -> WirePatch {
        WirePatch {
            id,
            content: self.content,
            attachments: self.attachments,
            reactions: self.reactions,
            edited_at: None,
            tombstoned: self.tombstoned,
        }
    }
}

impl From<&MessagePatch> for UpdateMessageRequest {
    fn from(p: &MessagePatch) -> Self {
        let wire = WirePatch::from(p);
        Self {
            content: wire.content,
            attachments: wire.attachments,
            reactions: wire.reactions,
            tombstoned: wire.tombstoned,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&WireMessage> for WirePatch {
    /// Field-complete patch, as carried by change-feed updates.
    fn from(m: &WireMessage) -> Self {
        Self {
            id: m.id,
            content: Some(m.content.clone()),
            attachments: Some(m.attachments.clone()),
            reactions: Some(m.reactions.clone()),
            edited_at: m.edited_at,
            tombstoned: Some(m.tombstoned),
        }
    }
}
