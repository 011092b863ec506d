use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::warn;

use atelier_types::models::{
    Message, MessageId, MessagePatch, SortKey, ThreadId, dedupe_reactions,
};

/// Immutable, ordered view of a thread at one store version.
///
/// Cloning is O(1). Messages are shared with the store, which copies one
/// only when it patches it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: u64,
    messages: Arc<[Arc<Message>]>,
    positions: Arc<HashMap<MessageId, usize>>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            messages: Arc::from(Vec::new()),
            positions: Arc::default(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Messages in ascending `(created_at, id)` order.
    pub fn messages(&self) -> &[Arc<Message>] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.positions.get(&id).map(|&at| &*self.messages[at])
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.id).collect()
    }
}

/// What a write did, for observers that animate or count unread messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub inserted: Vec<MessageId>,
    pub patched: Vec<MessageId>,
    pub removed: Vec<MessageId>,
}

impl MergeResult {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.patched.is_empty() && self.removed.is_empty()
    }

    pub fn extend(&mut self, other: MergeResult) {
        self.inserted.extend(other.inserted);
        self.patched.extend(other.patched);
        self.removed.extend(other.removed);
    }
}

/// Authoritative, deduplicated, ordered messages of one thread.
///
/// Ordered by [`SortKey`] in a `BTreeMap`, with an id index to find a
/// message's key. The published snapshot is rebuilt once per effective write
/// so reads never copy.
#[derive(Debug)]
pub struct MessageStore {
    thread_id: ThreadId,
    by_key: BTreeMap<SortKey, Arc<Message>>,
    keys: HashMap<MessageId, SortKey>,
    version: u64,
    published: Snapshot,
}

impl MessageStore {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            by_key: BTreeMap::new(),
            keys: HashMap::new(),
            version: 0,
            published: Snapshot::empty(),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.keys
            .get(&id)
            .and_then(|key| self.by_key.get(key))
            .map(Arc::as_ref)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.published.clone()
    }

    /// Idempotent upsert.
    ///
    /// Unknown ids are inserted at their sort position; known ids are patched
    /// field by field and never move. Messages for another thread are dropped.
    pub fn merge(&mut self, messages: impl IntoIterator<Item = Message>) -> MergeResult {
        let mut result = MergeResult::default();

        for mut incoming in messages {
            if incoming.thread_id != self.thread_id {
                warn!(
                    thread_id = %self.thread_id,
                    message_id = %incoming.id,
                    other_thread = %incoming.thread_id,
                    "dropping message for another thread"
                );
                continue;
            }

            incoming.reactions = dedupe_reactions(std::mem::take(&mut incoming.reactions));
            if incoming.tombstoned {
                incoming.tombstone();
            }

            match self.keys.get(&incoming.id).copied() {
                Some(key) => {
                    let Some(existing) = self.by_key.get_mut(&key) else {
                        continue;
                    };
                    if incoming.created_at != existing.created_at {
                        warn!(
                            thread_id = %self.thread_id,
                            message_id = %incoming.id,
                            stored = %existing.created_at,
                            incoming = %incoming.created_at,
                            "created_at changed for a known id; keeping the stored timestamp"
                        );
                    }
                    if patch_shared(existing, &MessagePatch::from_message(&incoming)) {
                        result.patched.push(incoming.id);
                    }
                }
                None => {
                    let key = incoming.sort_key();
                    result.inserted.push(incoming.id);
                    self.keys.insert(incoming.id, key);
                    self.by_key.insert(key, Arc::new(incoming));
                }
            }
        }

        self.commit(&result);
        result
    }

    /// Patch one message. `None` when the id is not stored.
    pub fn patch(&mut self, patch: &MessagePatch) -> Option<MergeResult> {
        let key = *self.keys.get(&patch.id)?;
        let existing = self.by_key.get_mut(&key)?;

        let mut result = MergeResult::default();
        if patch_shared(existing, patch) {
            result.patched.push(patch.id);
        }
        self.commit(&result);
        Some(result)
    }

    /// Overwrite one message exactly, tombstone included. Used to undo an
    /// optimistic patch when other writes happened in between.
    pub fn restore(&mut self, message: Message) -> MergeResult {
        let mut result = MergeResult::default();

        match self.keys.get(&message.id).copied() {
            Some(key) => {
                if let Some(existing) = self.by_key.get_mut(&key) {
                    if **existing != message {
                        let id = message.id;
                        // created_at is part of the key and cannot change here.
                        *existing = Arc::new(Message {
                            created_at: existing.created_at,
                            ..message
                        });
                        result.patched.push(id);
                    }
                }
            }
            None => return self.merge([message]),
        }

        self.commit(&result);
        result
    }

    /// Physically drop a message. Only ever used to withdraw a failed
    /// optimistic send.
    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let key = self.keys.remove(&id)?;
        let removed = self.by_key.remove(&key);
        self.commit(&MergeResult {
            removed: vec![id],
            ..MergeResult::default()
        });
        removed.map(Arc::unwrap_or_clone)
    }

    /// Replace a temporary id with the backend's message.
    pub fn remap(&mut self, temp_id: MessageId, authoritative: Message) -> MergeResult {
        let mut result = MergeResult::default();
        if temp_id != authoritative.id {
            if let Some(key) = self.keys.remove(&temp_id) {
                self.by_key.remove(&key);
                result.removed.push(temp_id);
            }
        }
        // merge() commits; an unmatched removal must still publish.
        let merged = self.merge([authoritative]);
        if merged.is_empty() && !result.is_empty() {
            self.commit(&result);
        }
        result.extend(merged);
        result
    }

    /// Replace the whole state with `prior`.
    pub fn rollback(&mut self, prior: &Snapshot) -> MergeResult {
        let current = self.snapshot();

        self.by_key.clear();
        self.keys.clear();
        for message in prior.messages() {
            let key = message.sort_key();
            self.keys.insert(message.id, key);
            self.by_key.insert(key, message.clone());
        }

        let mut result = MergeResult::default();
        for message in current.messages() {
            match prior.get(message.id) {
                None => result.removed.push(message.id),
                Some(old) if old != &**message => result.patched.push(message.id),
                Some(_) => {}
            }
        }
        for message in prior.messages() {
            if current.get(message.id).is_none() {
                result.inserted.push(message.id);
            }
        }

        self.commit(&result);
        result
    }

    /// Drop everything, used when a session closes.
    pub fn clear(&mut self) {
        let removed = self.keys.keys().copied().collect();
        self.by_key.clear();
        self.keys.clear();
        self.commit(&MergeResult {
            removed,
            ..MergeResult::default()
        });
    }

    fn commit(&mut self, result: &MergeResult) {
        if result.is_empty() {
            return;
        }
        self.version += 1;
        let messages: Arc<[Arc<Message>]> = self.by_key.values().cloned().collect();
        let positions = messages.iter().enumerate().map(|(at, m)| (m.id, at)).collect();
        self.published = Snapshot {
            version: self.version,
            messages,
            positions: Arc::new(positions),
        };
    }
}

/// Apply `patch` without disturbing snapshots that share the message.
fn patch_shared(slot: &mut Arc<Message>, patch: &MessagePatch) -> bool {
    let mut next = Message::clone(&**slot);
    if !next.apply_patch(patch) {
        return false;
    }
    *slot = Arc::new(next);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_types::models::{Attachment, Reaction, TOMBSTONE_CONTENT};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    const THREAD: u128 = 0x5C;

    fn message(secs: i64, id: u128) -> Message {
        Message {
            id: Uuid::from_u128(id),
            thread_id: Uuid::from_u128(THREAD),
            author_id: Uuid::from_u128(1),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            content: format!("m{}", id),
            attachments: vec![],
            reactions: vec![],
            edited_at: None,
            tombstoned: false,
        }
    }

    fn store() -> MessageStore {
        MessageStore::new(Uuid::from_u128(THREAD))
    }

    fn assert_strictly_ordered(snapshot: &Snapshot) {
        for pair in snapshot.messages().windows(2) {
            assert!(pair[0].sort_key() < pair[1].sort_key());
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let mut s = store();
        let first = s.merge([message(10, 1)]);
        assert_eq!(first.inserted, vec![Uuid::from_u128(1)]);
        let once = s.snapshot();

        let second = s.merge([message(10, 1)]);
        assert!(second.is_empty());
        assert_eq!(s.snapshot().messages(), once.messages());
        assert_eq!(s.snapshot().version(), once.version());
    }

    #[test]
    fn orders_by_timestamp_then_id() {
        let mut s = store();
        s.merge([message(30, 3), message(10, 9), message(10, 2), message(20, 1)]);
        let snap = s.snapshot();
        assert_eq!(
            snap.ids(),
            vec![2, 9, 1, 3].into_iter().map(Uuid::from_u128).collect::<Vec<_>>()
        );
        assert_strictly_ordered(&snap);
    }

    #[test]
    fn overlapping_pages_do_not_duplicate() {
        let mut s = store();
        s.merge((1..=20).map(|i| message(i, i as u128)));
        let result = s.merge((15..=30).map(|i| message(i, i as u128)));
        assert_eq!(result.inserted.len(), 10);
        assert_eq!(s.len(), 30);

        let mut ids = s.snapshot().ids();
        ids.dedup();
        assert_eq!(ids.len(), 30);
        assert_strictly_ordered(&s.snapshot());
    }

    #[test]
    fn known_id_is_patched_in_place() {
        let mut s = store();
        s.merge([message(10, 1), message(20, 2)]);

        let mut edited = message(10, 1);
        edited.content = "updated".into();
        edited.edited_at = Some(Utc.timestamp_opt(50, 0).unwrap());
        edited.attachments = vec![Attachment {
            name: "plinth.pdf".into(),
            url: "https://f/plinth.pdf".into(),
            kind: "application/pdf".into(),
            size: 1,
        }];
        let result = s.merge([edited]);
        assert_eq!(result.patched, vec![Uuid::from_u128(1)]);

        let snap = s.snapshot();
        assert_eq!(snap.messages()[0].content, "updated");
        assert_eq!(snap.messages()[0].attachments.len(), 1);
    }

    #[test]
    fn created_at_change_is_ignored() {
        let mut s = store();
        s.merge([message(10, 1), message(20, 2)]);

        let mut moved = message(99, 1);
        moved.content = "moved?".into();
        s.merge([moved]);

        let snap = s.snapshot();
        assert_eq!(snap.ids()[0], Uuid::from_u128(1));
        assert_eq!(snap.messages()[0].created_at, Utc.timestamp_opt(10, 0).unwrap());
        assert_eq!(snap.messages()[0].content, "moved?");
    }

    #[test]
    fn tombstone_survives_stale_merge() {
        let mut s = store();
        s.merge([message(10, 1)]);
        let mut dead = message(10, 1);
        dead.tombstoned = true;
        s.merge([dead]);

        // A page fetched before the delete arrives late.
        s.merge([message(10, 1)]);
        let m = s.get(Uuid::from_u128(1)).unwrap();
        assert!(m.tombstoned);
        assert_eq!(m.content, TOMBSTONE_CONTENT);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn duplicate_reactions_are_collapsed_on_merge() {
        let mut s = store();
        let mut m = message(10, 1);
        let r = Reaction {
            reaction: "👍".into(),
            user_id: Uuid::from_u128(4),
            username: None,
        };
        m.reactions = vec![r.clone(), r];
        s.merge([m]);
        assert_eq!(s.get(Uuid::from_u128(1)).unwrap().reactions.len(), 1);
    }

    #[test]
    fn foreign_thread_messages_are_dropped() {
        let mut s = store();
        let mut m = message(10, 1);
        m.thread_id = Uuid::from_u128(0xBAD);
        assert!(s.merge([m]).is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn remap_replaces_temporary_entry() {
        let mut s = store();
        s.merge([message(10, 1), message(30, 0xFFFF)]);

        let real = message(20, 77);
        let result = s.remap(Uuid::from_u128(0xFFFF), real);
        assert_eq!(result.removed, vec![Uuid::from_u128(0xFFFF)]);
        assert_eq!(result.inserted, vec![Uuid::from_u128(77)]);
        assert_eq!(s.snapshot().ids(), vec![Uuid::from_u128(1), Uuid::from_u128(77)]);

        // Remapping again after the feed already delivered the real row is a no-op.
        assert!(s.remap(Uuid::from_u128(0xFFFF), message(20, 77)).is_empty());
    }

    #[test]
    fn rollback_restores_prior_snapshot_exactly() {
        let mut s = store();
        s.merge([message(10, 1), message(20, 2)]);
        let prior = s.snapshot();

        s.patch(&MessagePatch {
            content: Some("optimistic".into()),
            ..MessagePatch::new(Uuid::from_u128(2))
        });
        s.merge([message(30, 3)]);

        let result = s.rollback(&prior);
        assert_eq!(result.patched, vec![Uuid::from_u128(2)]);
        assert_eq!(result.removed, vec![Uuid::from_u128(3)]);
        assert_eq!(s.snapshot().messages(), prior.messages());
        assert!(!s.contains(Uuid::from_u128(3)));
    }

    #[test]
    fn restore_can_undo_a_tombstone() {
        let mut s = store();
        let original = message(10, 1);
        s.merge([original.clone()]);
        s.patch(&MessagePatch {
            tombstoned: Some(true),
            ..MessagePatch::new(original.id)
        });
        assert!(s.get(original.id).unwrap().tombstoned);

        s.restore(original.clone());
        assert_eq!(s.get(original.id), Some(&original));
    }

    #[test]
    fn patch_unknown_id_reports_none() {
        let mut s = store();
        assert!(s.patch(&MessagePatch::new(Uuid::from_u128(5))).is_none());
        assert_eq!(s.version(), 0);
    }

    #[test]
    fn snapshots_are_immutable() {
        let mut s = store();
        s.merge([message(10, 1)]);
        let before = s.snapshot();
        s.merge([message(20, 2)]);
        assert_eq!(before.len(), 1);
        assert_eq!(s.snapshot().len(), 2);
        assert!(s.snapshot().version() > before.version());
    }

    #[test]
    fn patching_copies_only_the_touched_message() {
        let mut s = store();
        s.merge([message(10, 1), message(20, 2)]);
        let before = s.snapshot();

        s.patch(&MessagePatch {
            content: Some("cast in bronze".into()),
            ..MessagePatch::new(Uuid::from_u128(2))
        })
        .unwrap();
        let after = s.snapshot();

        assert!(Arc::ptr_eq(&before.messages()[0], &after.messages()[0]));
        assert_eq!(before.get(Uuid::from_u128(2)).unwrap().content, "m2");
        assert_eq!(after.get(Uuid::from_u128(2)).unwrap().content, "cast in bronze");
        assert!(after.get(Uuid::from_u128(3)).is_none());
    }
}
