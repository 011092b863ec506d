use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use atelier_types::events::ChangeEvent;
use atelier_types::models::{MessageId, MessagePatch};

use crate::backend::FeedStream;
use crate::error::SyncError;
use crate::ingest;
use crate::lane::{Epoch, Lane, merge_and_replay, replay_orphans};
use crate::ledger::SendLedger;
use crate::store::MergeResult;

/// Updates that arrived before the message they target.
///
/// Bounded: when full, the oldest entry is dropped. Entries older than the
/// TTL are dropped on every access. A dropped update is recovered by the
/// next page fetch, which carries complete rows.
#[derive(Debug)]
pub struct OrphanBuffer {
    capacity: usize,
    ttl: Duration,
    entries: VecDeque<(Instant, MessagePatch)>,
}

impl OrphanBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, patch: MessagePatch, now: Instant) {
        self.expire(now);
        if self.entries.len() >= self.capacity {
            if let Some((_, dropped)) = self.entries.pop_front() {
                warn!(message_id = %dropped.id, "orphan buffer full, dropping oldest update");
            }
        }
        self.entries.push_back((now, patch));
    }

    /// Remove and return the buffered updates for `id`, in arrival order.
    pub fn take(&mut self, id: MessageId, now: Instant) -> Vec<MessagePatch> {
        self.expire(now);
        if !self.entries.iter().any(|(_, p)| p.id == id) {
            return Vec::new();
        }
        let (hits, rest): (VecDeque<_>, VecDeque<_>) =
            self.entries.drain(..).partition(|(_, p)| p.id == id);
        self.entries = rest;
        hits.into_iter().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, patch)) = self.entries.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            debug!(message_id = %patch.id, "orphan update expired");
            self.entries.pop_front();
        }
    }
}

/// Applies change-feed events to a thread's lane.
pub struct FeedReconciler {
    lane: Arc<Lane>,
    ledger: Arc<SendLedger>,
    epoch: Epoch,
}

impl FeedReconciler {
    pub fn new(lane: Arc<Lane>, ledger: Arc<SendLedger>, epoch: Epoch) -> Self {
        Self {
            lane,
            ledger,
            epoch,
        }
    }

    pub fn apply(&self, event: ChangeEvent) -> Result<MergeResult, SyncError> {
        self.apply_at(event, Instant::now())
    }

    pub fn apply_at(&self, event: ChangeEvent, now: Instant) -> Result<MergeResult, SyncError> {
        let thread_id = self.lane.thread_id();
        if event.thread_id() != thread_id {
            warn!(
                %thread_id,
                other_thread = %event.thread_id(),
                "feed event for another thread ignored"
            );
            return Ok(MergeResult::default());
        }

        match event {
            ChangeEvent::Insert { message } => {
                let message = ingest::message(message);
                let ledger = &self.ledger;
                self.lane.write(self.epoch, |state| {
                    let result = if state.store.contains(message.id) {
                        state.store.merge([message])
                    } else if let Some(temp_id) = ledger.claim(&message) {
                        debug!(%thread_id, %temp_id, message_id = %message.id, "feed confirmed pending send");
                        let mut result = state.store.remap(temp_id, message);
                        let replayed = replay_orphans(state, &result.inserted, now);
                        result.extend(replayed);
                        result
                    } else {
                        merge_and_replay(state, vec![message], now)
                    };
                    (result.clone(), result)
                })
            }
            ChangeEvent::Update { patch, .. } => {
                let patch = ingest::patch(patch);
                self.lane.write(self.epoch, |state| match state.store.patch(&patch) {
                    Some(result) => (result.clone(), result),
                    None => {
                        debug!(%thread_id, message_id = %patch.id, "update for unknown message buffered");
                        state.orphans.push(patch, now);
                        (MergeResult::default(), MergeResult::default())
                    }
                })
            }
        }
    }

    /// Drain `feed` until it ends or the session closes.
    pub async fn run(&self, mut feed: FeedStream) -> FeedEnd {
        let thread_id = self.lane.thread_id();
        debug!(%thread_id, "change feed attached");

        while let Some(event) = feed.next().await {
            match self.apply(event) {
                Ok(_) => {}
                Err(SyncError::StaleEpoch { .. }) => {
                    debug!(%thread_id, "session closed, detaching change feed");
                    return FeedEnd::Detached;
                }
                Err(e) => warn!(%thread_id, "feed event not applied: {}", e),
            }
        }

        if self.lane.is_current(self.epoch) {
            info!(%thread_id, "change feed closed by remote");
            FeedEnd::Closed
        } else {
            FeedEnd::Detached
        }
    }
}

/// Why [`FeedReconciler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEnd {
    /// The session went away; nothing to resume.
    Detached,
    /// The remote ended the stream while the session is still open.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_types::api::{WireMessage, WirePatch};
    use atelier_types::models::Message;
    use chrono::{TimeZone, Utc};
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use crate::config::SyncConfig;

    const THREAD: u128 = 1;

    fn message(secs: i64, id: u128) -> Message {
        Message {
            id: Uuid::from_u128(id),
            thread_id: Uuid::from_u128(THREAD),
            author_id: Uuid::from_u128(2),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            content: format!("m{}", id),
            attachments: vec![],
            reactions: vec![],
            edited_at: None,
            tombstoned: false,
        }
    }

    fn insert(m: &Message) -> ChangeEvent {
        ChangeEvent::Insert {
            message: WireMessage::from(m),
        }
    }

    fn update(id: u128, content: &str) -> ChangeEvent {
        ChangeEvent::Update {
            thread_id: Uuid::from_u128(THREAD),
            patch: WirePatch::from(&MessagePatch {
                content: Some(content.into()),
                ..MessagePatch::new(Uuid::from_u128(id))
            }),
        }
    }

    fn reconciler() -> (FeedReconciler, Arc<Lane>, Arc<SendLedger>) {
        let (tx, _) = broadcast::channel(16);
        let lane = Arc::new(Lane::new(Uuid::from_u128(THREAD), 0, &SyncConfig::default(), tx));
        let ledger = Arc::new(SendLedger::new());
        (
            FeedReconciler::new(lane.clone(), ledger.clone(), 0),
            lane,
            ledger,
        )
    }

    #[test]
    fn out_of_order_inserts_land_in_order() {
        let (feed, lane, _) = reconciler();
        for m in [message(3, 3), message(1, 1), message(2, 2)] {
            feed.apply(insert(&m)).unwrap();
        }
        let ids: Vec<_> = lane.snapshot().ids().into_iter().map(|id| id.as_u128()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_delivery_yields_one_message() {
        let (feed, lane, _) = reconciler();
        let m = message(1, 1);
        let first = feed.apply(insert(&m)).unwrap();
        let second = feed.apply(insert(&m)).unwrap();
        assert_eq!(first.inserted.len(), 1);
        assert!(second.is_empty());
        assert_eq!(lane.snapshot().len(), 1);
    }

    #[test]
    fn update_before_insert_is_replayed() {
        let (feed, lane, _) = reconciler();
        feed.apply(update(4, "final finish: satin")).unwrap();
        assert!(lane.snapshot().is_empty());

        feed.apply(insert(&message(1, 4))).unwrap();
        assert_eq!(lane.get(Uuid::from_u128(4)).unwrap().content, "final finish: satin");
    }

    #[test]
    fn insert_matching_open_send_replaces_optimistic_entry() {
        let (feed, lane, ledger) = reconciler();
        let optimistic = message(10, 900);
        ledger.open(&optimistic);
        lane.merge(0, vec![optimistic.clone()]).unwrap();

        let real = Message {
            id: Uuid::from_u128(42),
            created_at: Utc.timestamp_opt(9, 0).unwrap(),
            ..optimistic
        };
        let result = feed.apply(insert(&real)).unwrap();
        assert_eq!(result.removed, vec![Uuid::from_u128(900)]);
        assert_eq!(lane.snapshot().ids(), vec![Uuid::from_u128(42)]);
        assert_eq!(ledger.resolve_id(Uuid::from_u128(900)), Uuid::from_u128(42));
    }

    #[test]
    fn events_after_close_are_refused() {
        let (feed, lane, _) = reconciler();
        lane.invalidate();
        assert!(matches!(
            feed.apply(insert(&message(1, 1))),
            Err(SyncError::StaleEpoch { .. })
        ));
    }

    #[test]
    fn orphan_buffer_expires_and_evicts() {
        let start = Instant::now();
        let mut buffer = OrphanBuffer::new(2, Duration::from_secs(30));
        buffer.push(MessagePatch::new(Uuid::from_u128(1)), start);
        buffer.push(MessagePatch::new(Uuid::from_u128(2)), start);
        buffer.push(MessagePatch::new(Uuid::from_u128(3)), start);
        assert_eq!(buffer.len(), 2);
        assert!(buffer.take(Uuid::from_u128(1), start).is_empty());

        let later = start + Duration::from_secs(31);
        assert!(buffer.take(Uuid::from_u128(2), later).is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn orphan_updates_replay_in_arrival_order() {
        let now = Instant::now();
        let mut buffer = OrphanBuffer::new(8, Duration::from_secs(30));
        for content in ["first", "second"] {
            buffer.push(
                MessagePatch {
                    content: Some(content.into()),
                    ..MessagePatch::new(Uuid::from_u128(1))
                },
                now,
            );
        }
        buffer.push(MessagePatch::new(Uuid::from_u128(2)), now);

        let taken = buffer.take(Uuid::from_u128(1), now);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[1].content.as_deref(), Some("second"));
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn remote_close_is_told_apart_from_session_close() {
        let (feed, lane, _) = reconciler();
        let events = futures_util::stream::iter(vec![insert(&message(1, 1))]);
        assert_eq!(feed.run(Box::pin(events)).await, FeedEnd::Closed);
        assert_eq!(lane.snapshot().len(), 1);

        lane.invalidate();
        let events = futures_util::stream::iter(Vec::<ChangeEvent>::new());
        assert_eq!(feed.run(Box::pin(events)).await, FeedEnd::Detached);
    }
}
