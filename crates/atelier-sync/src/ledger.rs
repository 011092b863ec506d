use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use atelier_types::models::{Attachment, Message, MessageId, UserId};

/// An optimistic send that has not been confirmed by its own response yet.
#[derive(Debug, Clone)]
struct OpenSend {
    temp_id: MessageId,
    author_id: UserId,
    content: String,
    attachments: Vec<Attachment>,
    /// Backend id, once a feed insert has been matched to this send.
    claimed: Option<MessageId>,
}

impl OpenSend {
    fn matches(&self, message: &Message) -> bool {
        self.author_id == message.author_id
            && self.content == message.content
            && self.attachments == message.attachments
    }
}

/// How a send response lined up with what the feed already did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The response is the first word on this send.
    Fresh,
    /// The feed already matched this send to the same backend id.
    AlreadyClaimed,
    /// The feed matched this send to another backend row, which in fact
    /// belongs to `other_temp`. That optimistic entry is now a duplicate.
    Transferred { other_temp: MessageId },
}

/// Open sends and the temporary-to-backend id table of one session.
///
/// Locked briefly and never held across an await or while taking another
/// lock other than the lane's (lane first, then ledger).
#[derive(Debug, Default)]
pub struct SendLedger {
    inner: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    open: Vec<OpenSend>,
    remaps: HashMap<MessageId, MessageId>,
}

impl SendLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, message: &Message) {
        self.lock().open.push(OpenSend {
            temp_id: message.id,
            author_id: message.author_id,
            content: message.content.clone(),
            attachments: message.attachments.clone(),
            claimed: None,
        });
    }

    /// Match a feed insert to the oldest open send with the same author,
    /// content and attachments. Returns that send's temporary id.
    pub fn claim(&self, message: &Message) -> Option<MessageId> {
        let mut state = self.lock();
        if state.remaps.values().any(|real| *real == message.id) {
            return None;
        }
        let send = state
            .open
            .iter_mut()
            .find(|s| s.claimed.is_none() && s.matches(message))?;
        send.claimed = Some(message.id);
        let temp_id = send.temp_id;
        state.remaps.insert(temp_id, message.id);
        Some(temp_id)
    }

    /// Close a send whose create call succeeded with `real_id`.
    pub fn resolve(&self, temp_id: MessageId, real_id: MessageId) -> Resolution {
        let mut state = self.lock();
        let Some(pos) = state.open.iter().position(|s| s.temp_id == temp_id) else {
            state.remaps.insert(temp_id, real_id);
            return Resolution::Fresh;
        };
        let send = state.open.remove(pos);
        state.remaps.insert(temp_id, real_id);

        match send.claimed {
            None => {
                // The feed may have given our row to an identical later send.
                if let Some(other) = state
                    .open
                    .iter()
                    .position(|s| s.claimed == Some(real_id))
                {
                    state.open[other].claimed = None;
                    let other_temp = state.open[other].temp_id;
                    state.remaps.remove(&other_temp);
                }
                Resolution::Fresh
            }
            Some(claimed) if claimed == real_id => Resolution::AlreadyClaimed,
            Some(claimed) => {
                // Hand the row the feed gave us to the next identical send.
                match state.open.iter_mut().find(|s| {
                    s.claimed.is_none()
                        && s.author_id == send.author_id
                        && s.content == send.content
                        && s.attachments == send.attachments
                }) {
                    Some(other) => {
                        other.claimed = Some(claimed);
                        let other_temp = other.temp_id;
                        state.remaps.insert(other_temp, claimed);
                        Resolution::Transferred { other_temp }
                    }
                    None => Resolution::Fresh,
                }
            }
        }
    }

    /// Close a send whose create call failed. Returns the backend id if the
    /// feed had already delivered the row, in which case the send did land.
    pub fn fail(&self, temp_id: MessageId) -> Option<MessageId> {
        let mut state = self.lock();
        let pos = state.open.iter().position(|s| s.temp_id == temp_id)?;
        state.open.remove(pos).claimed
    }

    /// Follow the temporary-to-backend table; other ids map to themselves.
    pub fn resolve_id(&self, id: MessageId) -> MessageId {
        self.lock().remaps.get(&id).copied().unwrap_or(id)
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn message(id: u128, content: &str) -> Message {
        Message {
            id: Uuid::from_u128(id),
            thread_id: Uuid::from_u128(1),
            author_id: Uuid::from_u128(9),
            created_at: Utc::now(),
            content: content.into(),
            attachments: vec![],
            reactions: vec![],
            edited_at: None,
            tombstoned: false,
        }
    }

    #[test]
    fn feed_claims_matching_send_once() {
        let ledger = SendLedger::new();
        ledger.open(&message(100, "ready for patina"));

        assert_eq!(ledger.claim(&message(5, "something else")), None);
        assert_eq!(ledger.claim(&message(5, "ready for patina")), Some(Uuid::from_u128(100)));
        // Duplicate delivery of the same row does not claim again.
        assert_eq!(ledger.claim(&message(5, "ready for patina")), None);

        assert_eq!(ledger.resolve_id(Uuid::from_u128(100)), Uuid::from_u128(5));
        assert_eq!(
            ledger.resolve(Uuid::from_u128(100), Uuid::from_u128(5)),
            Resolution::AlreadyClaimed
        );
        assert_eq!(ledger.open_count(), 0);
    }

    #[test]
    fn identical_sends_swap_claims() {
        let ledger = SendLedger::new();
        ledger.open(&message(100, "same"));
        ledger.open(&message(101, "same"));

        // Feed delivers the second send's row first; it goes to the oldest send.
        assert_eq!(ledger.claim(&message(6, "same")), Some(Uuid::from_u128(100)));

        // The first send's response says its row is 5.
        assert_eq!(
            ledger.resolve(Uuid::from_u128(100), Uuid::from_u128(5)),
            Resolution::Transferred {
                other_temp: Uuid::from_u128(101)
            }
        );
        assert_eq!(ledger.resolve_id(Uuid::from_u128(101)), Uuid::from_u128(6));
        assert_eq!(
            ledger.resolve(Uuid::from_u128(101), Uuid::from_u128(6)),
            Resolution::AlreadyClaimed
        );
    }

    #[test]
    fn failed_send_reports_feed_claim() {
        let ledger = SendLedger::new();
        ledger.open(&message(100, "x"));
        ledger.open(&message(101, "y"));
        ledger.claim(&message(7, "y"));

        assert_eq!(ledger.fail(Uuid::from_u128(100)), None);
        assert_eq!(ledger.fail(Uuid::from_u128(101)), Some(Uuid::from_u128(7)));
    }
}
