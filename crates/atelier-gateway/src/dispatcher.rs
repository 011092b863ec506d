use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use atelier_types::events::ChangeEvent;

/// Fans change events out to every connected feed.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for change events. Each feed filters by thread.
    broadcast_tx: broadcast::Sender<ChangeEvent>,

    /// Open feed connections per thread: thread_id -> count
    watchers: RwLock<HashMap<Uuid, usize>>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                watchers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to change events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected feeds. Returns how many receivers
    /// saw it (zero when nobody is listening).
    pub fn broadcast(&self, event: ChangeEvent) -> usize {
        self.inner.broadcast_tx.send(event).unwrap_or(0)
    }

    /// Record a feed connection for `thread_id`. Returns the new count.
    pub async fn watch(&self, thread_id: Uuid) -> usize {
        let mut watchers = self.inner.watchers.write().await;
        let count = watchers.entry(thread_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop a feed connection for `thread_id`. Returns the remaining count.
    pub async fn unwatch(&self, thread_id: Uuid) -> usize {
        let mut watchers = self.inner.watchers.write().await;
        match watchers.get_mut(&thread_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                watchers.remove(&thread_id);
                0
            }
            None => 0,
        }
    }

    pub async fn watcher_count(&self, thread_id: Uuid) -> usize {
        self.inner
            .watchers
            .read()
            .await
            .get(&thread_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_types::api::WirePatch;

    fn update(thread: u128) -> ChangeEvent {
        ChangeEvent::Update {
            thread_id: Uuid::from_u128(thread),
            patch: WirePatch {
                id: Uuid::from_u128(99),
                content: Some("x".into()),
                attachments: None,
                reactions: None,
                edited_at: None,
                tombstoned: None,
            },
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let dispatcher = Dispatcher::new(16);
        assert_eq!(dispatcher.broadcast(update(1)), 0);

        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        assert_eq!(dispatcher.broadcast(update(1)), 2);

        assert_eq!(a.recv().await.unwrap().thread_id(), Uuid::from_u128(1));
        assert_eq!(b.recv().await.unwrap().thread_id(), Uuid::from_u128(1));
    }

    #[tokio::test]
    async fn watcher_counts_are_per_thread() {
        let dispatcher = Dispatcher::new(16);
        let t1 = Uuid::from_u128(1);
        let t2 = Uuid::from_u128(2);

        assert_eq!(dispatcher.watch(t1).await, 1);
        assert_eq!(dispatcher.watch(t1).await, 2);
        assert_eq!(dispatcher.watch(t2).await, 1);
        assert_eq!(dispatcher.unwatch(t1).await, 1);
        assert_eq!(dispatcher.unwatch(t1).await, 0);
        assert_eq!(dispatcher.unwatch(t1).await, 0);
        assert_eq!(dispatcher.watcher_count(t1).await, 0);
        assert_eq!(dispatcher.watcher_count(t2).await, 1);
    }
}
