//! Boundary validation: turns loosely-typed wire payloads into records the
//! rest of the system can trust.
//!
//! Nothing here fails as a whole. Malformed attachments and reactions are
//! dropped one by one and reported as [`ValidationIssue`]s so callers can log
//! them; the surrounding message always survives.

use serde_json::Value;
use uuid::Uuid;

use crate::api::{WireMessage, WirePatch};
use crate::models::{Attachment, Message, MessagePatch, Reaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    MalformedAttachment { index: usize, reason: &'static str },
    MalformedReaction { index: usize, reason: &'static str },
    DuplicateReaction { reaction: String, user_id: Uuid },
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedAttachment { index, reason } => {
                write!(f, "attachment #{} dropped: {}", index, reason)
            }
            Self::MalformedReaction { index, reason } => {
                write!(f, "reaction #{} dropped: {}", index, reason)
            }
            Self::DuplicateReaction { reaction, user_id } => {
                write!(f, "duplicate reaction '{}' by {} dropped", reaction, user_id)
            }
        }
    }
}

/// A validated value plus whatever had to be thrown away to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized<T> {
    pub value: T,
    pub issues: Vec<ValidationIssue>,
}

impl<T> Sanitized<T> {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Structural predicate for attachments: an object whose `name`, `url`,
/// `type` are strings and whose `size` is a non-negative integer.
pub fn attachment(value: &Value) -> Result<Attachment, &'static str> {
    let obj = value.as_object().ok_or("not an object")?;
    let name = obj.get("name").and_then(Value::as_str).ok_or("name missing or not a string")?;
    let url = obj.get("url").and_then(Value::as_str).ok_or("url missing or not a string")?;
    let kind = obj.get("type").and_then(Value::as_str).ok_or("type missing or not a string")?;
    let size = obj
        .get("size")
        .and_then(Value::as_u64)
        .ok_or("size missing or not a non-negative integer")?;

    Ok(Attachment {
        name: name.to_string(),
        url: url.to_string(),
        kind: kind.to_string(),
        size,
    })
}

/// Structural predicate for reactions: non-empty `reaction` string, a
/// `user_id` that parses as a UUID, and an optional string `username`.
pub fn reaction(value: &Value) -> Result<Reaction, &'static str> {
    let obj = value.as_object().ok_or("not an object")?;
    let kind = obj
        .get("reaction")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("reaction missing or empty")?;
    let user_id = obj
        .get("user_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Uuid>().ok())
        .ok_or("user_id missing or not a uuid")?;
    let username = match obj.get("username") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err("username not a string"),
    };

    Ok(Reaction {
        reaction: kind.to_string(),
        user_id,
        username,
    })
}

pub fn attachments(values: &[Value]) -> Sanitized<Vec<Attachment>> {
    let mut issues = Vec::new();
    let value = values
        .iter()
        .enumerate()
        .filter_map(|(index, v)| match attachment(v) {
            Ok(a) => Some(a),
            Err(reason) => {
                issues.push(ValidationIssue::MalformedAttachment { index, reason });
                None
            }
        })
        .collect();
    Sanitized { value, issues }
}

/// Validates each reaction and enforces one `(reaction, user_id)` pair.
pub fn reactions(values: &[Value]) -> Sanitized<Vec<Reaction>> {
    let mut issues = Vec::new();
    let mut value: Vec<Reaction> = Vec::with_capacity(values.len());
    for (index, v) in values.iter().enumerate() {
        match reaction(v) {
            Ok(r) => {
                if value
                    .iter()
                    .any(|seen| seen.reaction == r.reaction && seen.user_id == r.user_id)
                {
                    issues.push(ValidationIssue::DuplicateReaction {
                        reaction: r.reaction,
                        user_id: r.user_id,
                    });
                } else {
                    value.push(r);
                }
            }
            Err(reason) => issues.push(ValidationIssue::MalformedReaction { index, reason }),
        }
    }
    Sanitized { value, issues }
}

pub fn message(wire: WireMessage) -> Sanitized<Message> {
    let attachments = attachments(&wire.attachments);
    let reactions = reactions(&wire.reactions);

    let mut issues = attachments.issues;
    issues.extend(reactions.issues);

    let mut value = Message {
        id: wire.id,
        thread_id: wire.thread_id,
        author_id: wire.author_id,
        created_at: wire.created_at,
        content: wire.content,
        attachments: attachments.value,
        reactions: reactions.value,
        edited_at: wire.edited_at,
        tombstoned: wire.tombstoned,
    };
    if value.tombstoned {
        value.tombstone();
    }

    Sanitized { value, issues }
}

pub fn patch(wire: WirePatch) -> Sanitized<MessagePatch> {
    let mut issues = Vec::new();

    let attachments = wire.attachments.map(|values| {
        let s = attachments(&values);
        issues.extend(s.issues);
        s.value
    });
    let reactions = wire.reactions.map(|values| {
        let s = reactions(&values);
        issues.extend(s.issues);
        s.value
    });

    Sanitized {
        value: MessagePatch {
            id: wire.id,
            content: wire.content,
            attachments,
            reactions,
            edited_at: wire.edited_at,
            tombstoned: wire.tombstoned,
        },
        issues,
    }
}
