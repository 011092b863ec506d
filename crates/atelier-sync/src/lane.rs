use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::debug;

use atelier_types::models::{Message, MessageId, MessagePatch, ThreadId};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::feed::OrphanBuffer;
use crate::store::{MergeResult, MessageStore, Snapshot};

/// Fired after every write that changed a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub thread_id: ThreadId,
    pub version: u64,
    pub inserted: Vec<MessageId>,
    pub patched: Vec<MessageId>,
    pub removed: Vec<MessageId>,
}

/// Session generation a piece of async work was started under.
pub type Epoch = u64;

pub struct LaneState {
    pub store: MessageStore,
    pub orphans: OrphanBuffer,
}

/// The single writer of one thread's store.
///
/// Page loads, feed events and mutation results all land here. Each write
/// carries the epoch it was started under and is refused once the session
/// that spawned it has closed.
pub struct Lane {
    thread_id: ThreadId,
    epoch: AtomicU64,
    state: Mutex<LaneState>,
    changes: broadcast::Sender<StoreChange>,
}

impl Lane {
    pub fn new(
        thread_id: ThreadId,
        epoch: Epoch,
        config: &SyncConfig,
        changes: broadcast::Sender<StoreChange>,
    ) -> Self {
        Self {
            thread_id,
            epoch: AtomicU64::new(epoch),
            state: Mutex::new(LaneState {
                store: MessageStore::new(thread_id),
                orphans: OrphanBuffer::new(config.orphan_capacity, config.orphan_ttl),
            }),
            changes,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch() == epoch
    }

    pub fn check(&self, epoch: Epoch) -> Result<(), SyncError> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            Err(SyncError::StaleEpoch {
                thread_id: self.thread_id,
            })
        }
    }

    /// Make every outstanding epoch stale.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().store.snapshot()
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.lock().store.get(id).cloned()
    }

    /// Run `f` inside the critical section and publish what it changed.
    ///
    /// The epoch is checked under the lock, so no write slips in after
    /// [`Lane::invalidate`] has been observed.
    pub fn write<R>(
        &self,
        epoch: Epoch,
        f: impl FnOnce(&mut LaneState) -> (MergeResult, R),
    ) -> Result<R, SyncError> {
        let mut state = self.lock();
        self.check(epoch)?;

        let (result, value) = f(&mut *state);
        if !result.is_empty() {
            let change = StoreChange {
                thread_id: self.thread_id,
                version: state.store.version(),
                inserted: result.inserted,
                patched: result.patched,
                removed: result.removed,
            };
            drop(state);
            // No receivers is fine.
            let _ = self.changes.send(change);
        }
        Ok(value)
    }

    /// Merge validated messages, then replay any buffered updates for ids
    /// that just appeared.
    pub fn merge(&self, epoch: Epoch, messages: Vec<Message>) -> Result<MergeResult, SyncError> {
        self.write(epoch, |state| {
            let result = merge_and_replay(state, messages, Instant::now());
            (result.clone(), result)
        })
    }

    /// `Ok(None)` when the id is not in the store.
    pub fn patch(
        &self,
        epoch: Epoch,
        patch: &MessagePatch,
    ) -> Result<Option<MergeResult>, SyncError> {
        self.write(epoch, |state| match state.store.patch(patch) {
            Some(result) => (result.clone(), Some(result)),
            None => (MergeResult::default(), None),
        })
    }

    pub fn restore(&self, epoch: Epoch, message: Message) -> Result<MergeResult, SyncError> {
        self.write(epoch, |state| {
            let result = state.store.restore(message);
            (result.clone(), result)
        })
    }

    pub fn remove(&self, epoch: Epoch, id: MessageId) -> Result<Option<Message>, SyncError> {
        self.write(epoch, |state| match state.store.remove(id) {
            Some(message) => (
                MergeResult {
                    removed: vec![id],
                    ..MergeResult::default()
                },
                Some(message),
            ),
            None => (MergeResult::default(), None),
        })
    }

    pub fn remap(
        &self,
        epoch: Epoch,
        temp_id: MessageId,
        authoritative: Message,
    ) -> Result<MergeResult, SyncError> {
        self.write(epoch, |state| {
            let mut result = state.store.remap(temp_id, authoritative);
            let replayed = replay_orphans(state, &result.inserted, Instant::now());
            result.extend(replayed);
            (result.clone(), result)
        })
    }

    pub fn rollback(&self, epoch: Epoch, prior: &Snapshot) -> Result<MergeResult, SyncError> {
        self.write(epoch, |state| {
            let result = state.store.rollback(prior);
            (result.clone(), result)
        })
    }

    /// Drop the store contents and buffered updates. Ignores the epoch.
    pub fn discard(&self) {
        let mut state = self.lock();
        let dropped = state.store.len();
        state.store.clear();
        state.orphans.clear();
        debug!(thread_id = %self.thread_id, dropped, "lane discarded");
    }

    fn lock(&self) -> MutexGuard<'_, LaneState> {
        // Store writes are total; a panic elsewhere cannot leave it half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn merge_and_replay(
    state: &mut LaneState,
    messages: Vec<Message>,
    now: Instant,
) -> MergeResult {
    let mut result = state.store.merge(messages);
    let replayed = replay_orphans(state, &result.inserted, now);
    result.extend(replayed);
    result
}

pub(crate) fn replay_orphans(
    state: &mut LaneState,
    inserted: &[MessageId],
    now: Instant,
) -> MergeResult {
    let mut result = MergeResult::default();
    for id in inserted {
        for patch in state.orphans.take(*id, now) {
            debug!(message_id = %id, "replaying buffered update");
            if let Some(r) = state.store.patch(&patch) {
                result.patched.extend(r.patched.into_iter().filter(|p| !inserted.contains(p)));
            }
        }
    }
    result.patched.dedup();
    result
}
