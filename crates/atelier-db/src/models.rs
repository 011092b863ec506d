/// Database row types, mapped one to one onto SQLite rows.
/// Distinct from atelier-types models to keep the DB layer independent.
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use atelier_types::api::WireMessage;
use atelier_types::models::Message;

pub struct ThreadRow {
    pub id: String,
    pub topic: String,
    pub created_at: i64,
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub thread_id: String,
    pub author_id: String,
    pub content: String,
    pub attachments: String,
    pub reactions: String,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    pub tombstoned: bool,
}

impl MessageRow {
    pub fn from_message(m: &Message) -> Result<Self> {
        Ok(Self {
            id: m.id.to_string(),
            thread_id: m.thread_id.to_string(),
            author_id: m.author_id.to_string(),
            content: m.content.clone(),
            attachments: serde_json::to_string(&m.attachments)?,
            reactions: serde_json::to_string(&m.reactions)?,
            created_at: m.created_at.timestamp_micros(),
            edited_at: m.edited_at.map(|t| t.timestamp_micros()),
            tombstoned: m.tombstoned,
        })
    }

    /// Convert to the wire shape. Corrupt columns are logged and defaulted
    /// rather than failing the whole page.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: parse_uuid(&self.id, "id", &self.id),
            thread_id: parse_uuid(&self.thread_id, "thread_id", &self.id),
            author_id: parse_uuid(&self.author_id, "author_id", &self.id),
            created_at: from_micros(self.created_at, &self.id),
            content: self.content.clone(),
            attachments: parse_json_list(&self.attachments, "attachments", &self.id),
            reactions: parse_json_list(&self.reactions, "reactions", &self.id),
            edited_at: self.edited_at.map(|t| from_micros(t, &self.id)),
            tombstoned: self.tombstoned,
        }
    }
}

fn parse_uuid(raw: &str, column: &str, message_id: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}' on message '{}': {}", column, raw, message_id, e);
        Uuid::default()
    })
}

pub(crate) fn from_micros(micros: i64, message_id: &str) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_else(|| {
        warn!("Corrupt timestamp {} on message '{}'", micros, message_id);
        DateTime::default()
    })
}

fn parse_json_list(raw: &str, column: &str, message_id: &str) -> Vec<Value> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("Corrupt {} JSON on message '{}': {}", column, message_id, e);
        Vec::new()
    })
}
