//! Optimistic writes.
//!
//! Every mutation applies locally first, then calls the backend, then either
//! confirms with the authoritative row or puts the store back. Mutations on
//! the same message run one at a time in arrival order; each one reads the
//! state its predecessor left behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use atelier_types::models::{
    Attachment, Message, MessageId, MessagePatch, ThreadId, toggle_reaction,
};

use crate::backend::ThreadBackend;
use crate::config::Identity;
use crate::error::SyncError;
use crate::ingest;
use crate::lane::{Epoch, Lane};
use crate::ledger::{Resolution, SendLedger};
use crate::store::MergeResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    Send,
    Edit,
    Delete,
    React { reaction: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Confirmed,
    RolledBack,
}

/// A mutation the backend has not answered yet.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub ticket: u64,
    pub message_id: MessageId,
    pub kind: MutationKind,
    pub state: MutationState,
    pub started_at: Instant,
}

type MessageLocks = Mutex<HashMap<MessageId, Arc<tokio::sync::Mutex<()>>>>;

pub struct MutationCoordinator {
    backend: Arc<dyn ThreadBackend>,
    lane: Arc<Lane>,
    ledger: Arc<SendLedger>,
    identity: Identity,
    epoch: Epoch,
    locks: MessageLocks,
    pending: Mutex<BTreeMap<u64, PendingMutation>>,
    next_ticket: AtomicU64,
}

impl MutationCoordinator {
    pub fn new(
        backend: Arc<dyn ThreadBackend>,
        lane: Arc<Lane>,
        ledger: Arc<SendLedger>,
        identity: Identity,
        epoch: Epoch,
    ) -> Self {
        Self {
            backend,
            lane,
            ledger,
            identity,
            epoch,
            locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    fn thread_id(&self) -> ThreadId {
        self.lane.thread_id()
    }

    /// Mutations still waiting on the backend, oldest first.
    pub fn pending(&self) -> Vec<PendingMutation> {
        lock(&self.pending).values().cloned().collect()
    }

    /// Post a new message under a temporary id.
    ///
    /// Returns the confirmed message carrying the backend id.
    pub async fn send(
        &self,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<Message, SyncError> {
        let temp_id = Uuid::new_v4();
        let _lock = self.lock_message(temp_id).await;
        let ticket = self.begin(temp_id, MutationKind::Send);

        let optimistic = Message {
            id: temp_id,
            thread_id: self.thread_id(),
            author_id: self.identity.user_id,
            created_at: Utc::now(),
            content,
            attachments,
            reactions: vec![],
            edited_at: None,
            tombstoned: false,
        };
        self.ledger.open(&optimistic);
        if let Err(e) = self.lane.merge(self.epoch, vec![optimistic.clone()]) {
            self.ledger.fail(temp_id);
            return Err(e);
        }

        let created = self
            .backend
            .create_message(self.thread_id(), &optimistic.content, &optimistic.attachments)
            .await;

        match created {
            Ok(wire) => {
                let confirmed = ingest::message(wire);
                let real_id = confirmed.id;
                if let Resolution::Transferred { other_temp } =
                    self.ledger.resolve(temp_id, real_id)
                {
                    debug!(thread_id = %self.thread_id(), %other_temp, "dropping duplicate optimistic entry");
                    self.lane.remove(self.epoch, other_temp)?;
                }
                self.lane.remap(self.epoch, temp_id, confirmed.clone())?;
                ticket.resolve(MutationState::Confirmed);
                Ok(self.lane.get(real_id).unwrap_or(confirmed))
            }
            Err(err) => {
                if let Some(real_id) = self.ledger.fail(temp_id) {
                    // The row reached us over the feed, so the send did land.
                    warn!(thread_id = %self.thread_id(), %real_id, "send errored after delivery: {}", err);
                    ticket.resolve(MutationState::Confirmed);
                    return self.lane.get(real_id).ok_or(SyncError::NotFound(real_id));
                }
                self.lane.remove(self.epoch, temp_id)?;
                ticket.resolve(MutationState::RolledBack);
                let err = SyncError::from_backend(err, None);
                warn!(thread_id = %self.thread_id(), %temp_id, "send rolled back: {}", err);
                Err(err)
            }
        }
    }

    /// Replace content, and attachments when given.
    pub async fn edit(
        &self,
        id: MessageId,
        content: String,
        attachments: Option<Vec<Attachment>>,
    ) -> Result<Message, SyncError> {
        self.mutate(id, MutationKind::Edit, |current| MessagePatch {
            content: Some(content),
            attachments,
            edited_at: Some(Utc::now()),
            ..MessagePatch::new(current.id)
        })
        .await
    }

    /// Tombstone a message.
    pub async fn delete(&self, id: MessageId) -> Result<Message, SyncError> {
        self.mutate(id, MutationKind::Delete, |current| MessagePatch {
            tombstoned: Some(true),
            ..MessagePatch::new(current.id)
        })
        .await
    }

    /// Toggle `reaction` for the current user. The backend receives the full
    /// resulting list.
    pub async fn react(&self, id: MessageId, reaction: String) -> Result<Message, SyncError> {
        let user_id = self.identity.user_id;
        let username = self.identity.username.clone();
        let kind = MutationKind::React {
            reaction: reaction.clone(),
        };
        self.mutate(id, kind, move |current| MessagePatch {
            reactions: Some(toggle_reaction(
                &current.reactions,
                &reaction,
                user_id,
                username.as_deref(),
            )),
            ..MessagePatch::new(current.id)
        })
        .await
    }

    async fn mutate(
        &self,
        requested: MessageId,
        kind: MutationKind,
        build: impl FnOnce(&Message) -> MessagePatch,
    ) -> Result<Message, SyncError> {
        // A temporary id stays locked until its send resolves.
        let _requested = self.lock_message(requested).await;
        let id = self.ledger.resolve_id(requested);
        let _resolved = if id != requested {
            debug!(%requested, %id, "mutation redirected to backend id");
            Some(self.lock_message(id).await)
        } else {
            None
        };

        let ticket = self.begin(id, kind);
        self.lane.check(self.epoch)?;
        let current = self.lane.get(id).ok_or(SyncError::NotFound(id))?;
        if current.tombstoned {
            return Err(SyncError::Conflict("message was deleted".into()));
        }

        let patch = build(&current);
        let (prior, optimistic_version, optimistic) = self.lane.write(self.epoch, |state| {
            let prior = state.store.snapshot();
            let result = state.store.patch(&patch).unwrap_or_default();
            let optimistic = state.store.get(id).cloned();
            (result, (prior, state.store.version(), optimistic))
        })?;

        match self.backend.update_message(id, &patch).await {
            Ok(wire) => {
                let confirmed = ingest::message(wire);
                // A feed update that landed meanwhile is at least as new as
                // this response, and this write's own echo is still to come.
                let adopted = self.lane.write(self.epoch, |state| {
                    if state.store.get(id) == optimistic.as_ref() {
                        (state.store.merge([confirmed.clone()]), true)
                    } else {
                        (MergeResult::default(), false)
                    }
                })?;
                if !adopted {
                    debug!(thread_id = %self.thread_id(), message_id = %id, "newer feed state kept over write response");
                }
                ticket.resolve(MutationState::Confirmed);
                Ok(self.lane.get(id).unwrap_or(confirmed))
            }
            Err(err) => {
                self.lane.write(self.epoch, |state| {
                    let result = if state.store.version() == optimistic_version {
                        state.store.rollback(&prior)
                    } else {
                        // Someone else wrote in between; put back only our fields.
                        match state.store.get(id) {
                            Some(now) => {
                                let reverted = revert_fields(now, &current, &patch);
                                state.store.restore(reverted)
                            }
                            None => MergeResult::default(),
                        }
                    };
                    (result, ())
                })?;
                ticket.resolve(MutationState::RolledBack);
                let err = SyncError::from_backend(err, Some(id));
                warn!(thread_id = %self.thread_id(), message_id = %id, "mutation rolled back: {}", err);
                Err(err)
            }
        }
    }

    fn begin(&self, message_id: MessageId, kind: MutationKind) -> Ticket<'_> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        debug!(thread_id = %self.thread_id(), %message_id, ?kind, ticket, "mutation pending");
        lock(&self.pending).insert(
            ticket,
            PendingMutation {
                ticket,
                message_id,
                kind,
                state: MutationState::Pending,
                started_at: Instant::now(),
            },
        );
        Ticket {
            pending: &self.pending,
            thread_id: self.thread_id(),
            ticket,
            resolved: false,
        }
    }

    async fn lock_message(&self, id: MessageId) -> MessageLock<'_> {
        let cell = lock(&self.locks).entry(id).or_default().clone();
        let guard = cell.lock_owned().await;
        MessageLock {
            locks: &self.locks,
            id,
            guard: Some(guard),
        }
    }
}

/// Undo `patch` on `now`, taking the touched fields from `before`.
fn revert_fields(now: &Message, before: &Message, patch: &MessagePatch) -> Message {
    let mut reverted = now.clone();
    if patch.content.is_some() {
        reverted.content.clone_from(&before.content);
    }
    if patch.attachments.is_some() {
        reverted.attachments.clone_from(&before.attachments);
    }
    if patch.reactions.is_some() {
        reverted.reactions.clone_from(&before.reactions);
    }
    if patch.edited_at.is_some() {
        reverted.edited_at = before.edited_at;
    }
    if patch.tombstoned.is_some() {
        reverted.tombstoned = before.tombstoned;
        reverted.content.clone_from(&before.content);
        reverted.attachments.clone_from(&before.attachments);
    }
    reverted
}

/// Tracks one mutation in the pending table until it resolves. Dropping an
/// unresolved ticket counts as a rollback.
struct Ticket<'a> {
    pending: &'a Mutex<BTreeMap<u64, PendingMutation>>,
    thread_id: ThreadId,
    ticket: u64,
    resolved: bool,
}

impl Ticket<'_> {
    fn resolve(mut self, state: MutationState) {
        self.finish(state);
    }

    fn finish(&mut self, state: MutationState) {
        self.resolved = true;
        if let Some(m) = lock(self.pending).remove(&self.ticket) {
            info!(
                thread_id = %self.thread_id,
                message_id = %m.message_id,
                kind = ?m.kind,
                ?state,
                elapsed_ms = m.started_at.elapsed().as_millis() as u64,
                "mutation resolved"
            );
        }
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.finish(MutationState::RolledBack);
        }
    }
}

/// Per-message FIFO lock. The map entry goes away with its last user.
struct MessageLock<'a> {
    locks: &'a MessageLocks,
    id: MessageId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for MessageLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock(self.locks);
        if locks.get(&self.id).is_some_and(|cell| Arc::strong_count(cell) == 1) {
            locks.remove(&self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
