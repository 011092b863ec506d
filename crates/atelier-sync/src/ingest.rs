//! Where wire payloads enter the engine.
//!
//! Everything coming back from a [`crate::backend::ThreadBackend`] passes
//! through here. Malformed attachments and reactions are dropped and logged;
//! the message itself always gets through.

use tracing::debug;

use atelier_types::api::{WireMessage, WirePatch};
use atelier_types::models::{Message, MessagePatch};
use atelier_types::validate::{self, ValidationIssue};

pub fn message(wire: WireMessage) -> Message {
    let id = wire.id;
    let sanitized = validate::message(wire);
    report(id, &sanitized.issues);
    sanitized.value
}

pub fn messages(wire: Vec<WireMessage>) -> Vec<Message> {
    wire.into_iter().map(message).collect()
}

pub fn patch(wire: WirePatch) -> MessagePatch {
    let id = wire.id;
    let sanitized = validate::patch(wire);
    report(id, &sanitized.issues);
    sanitized.value
}

fn report(id: uuid::Uuid, issues: &[ValidationIssue]) {
    for issue in issues {
        debug!(message_id = %id, %issue, "dropped malformed field");
    }
}
