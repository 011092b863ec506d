use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use atelier_types::models::{Attachment, Message, MessageId, ThreadId};

use crate::backend::{FeedStream, ThreadBackend};
use crate::config::{Identity, SyncConfig};
use crate::error::SyncError;
use crate::feed::{FeedEnd, FeedReconciler};
use crate::lane::{Epoch, Lane, StoreChange};
use crate::ledger::SendLedger;
use crate::loader::PageLoader;
use crate::mutation::{MutationCoordinator, PendingMutation};
use crate::store::Snapshot;

/// Everything the engine keeps for one open thread.
pub struct ThreadSession {
    thread_id: ThreadId,
    epoch: Epoch,
    lane: Arc<Lane>,
    loader: Arc<PageLoader>,
    mutations: Arc<MutationCoordinator>,
    feed_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ThreadSession {
    /// Subscribe to the thread's change feed and load its newest page.
    ///
    /// The feed is attached before the first fetch so nothing written in
    /// between is missed; the store absorbs the overlap.
    pub async fn open(
        thread_id: ThreadId,
        epoch: Epoch,
        backend: Arc<dyn ThreadBackend>,
        identity: Identity,
        config: &SyncConfig,
        changes: broadcast::Sender<StoreChange>,
    ) -> Result<Arc<Self>, SyncError> {
        let lane = Arc::new(Lane::new(thread_id, epoch, config, changes));
        let ledger = Arc::new(SendLedger::new());

        let feed = backend.subscribe(thread_id).await.map_err(|e| {
            warn!(%thread_id, "change feed subscription failed: {}", e);
            SyncError::from_backend(e, None)
        })?;
        let loader = Arc::new(PageLoader::new(
            backend.clone(),
            lane.clone(),
            epoch,
            config.page_size,
        ));
        let follower = FeedFollower {
            reconciler: FeedReconciler::new(lane.clone(), ledger.clone(), epoch),
            backend: backend.clone(),
            loader: loader.clone(),
            retry: config.feed_retry,
            retry_max: config.feed_retry_max,
        };
        let feed_task = tokio::spawn(follower.run(feed));

        let session = Arc::new(Self {
            thread_id,
            epoch,
            loader,
            mutations: Arc::new(MutationCoordinator::new(
                backend,
                lane.clone(),
                ledger,
                identity,
                epoch,
            )),
            lane,
            feed_task: Mutex::new(Some(feed_task)),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = session.loader.load_initial().await {
            session.close();
            return Err(e);
        }

        info!(%thread_id, epoch, messages = session.snapshot().len(), "thread session opened");
        Ok(session)
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lane.snapshot()
    }

    pub fn has_more(&self) -> bool {
        self.loader.has_more()
    }

    /// Load the next older page. `false` once history is exhausted.
    pub async fn load_more(&self) -> Result<bool, SyncError> {
        Ok(self.loader.load_more().await?.is_some())
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        self.mutations.pending()
    }

    pub async fn send(
        &self,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<Message, SyncError> {
        let mutations = self.mutations.clone();
        self.run_mutation(async move { mutations.send(content, attachments).await })
            .await
    }

    pub async fn edit(
        &self,
        id: MessageId,
        content: String,
        attachments: Option<Vec<Attachment>>,
    ) -> Result<Message, SyncError> {
        let mutations = self.mutations.clone();
        self.run_mutation(async move { mutations.edit(id, content, attachments).await })
            .await
    }

    pub async fn delete(&self, id: MessageId) -> Result<Message, SyncError> {
        let mutations = self.mutations.clone();
        self.run_mutation(async move { mutations.delete(id).await })
            .await
    }

    pub async fn react(&self, id: MessageId, reaction: String) -> Result<Message, SyncError> {
        let mutations = self.mutations.clone();
        self.run_mutation(async move { mutations.react(id, reaction).await })
            .await
    }

    /// Stop the feed, drop the store and stale every in-flight completion.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lane.invalidate();
        let task = self
            .feed_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            // Dropping the stream inside the task unsubscribes.
            task.abort();
        }
        self.lane.discard();
        info!(thread_id = %self.thread_id, epoch = self.epoch, "thread session closed");
    }

    /// Mutations run as their own tasks so a dropped caller cannot leave one
    /// half-applied.
    async fn run_mutation<F, T>(&self, mutation: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>> + Send + 'static,
        T: Send + 'static,
    {
        match tokio::spawn(mutation).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(SyncError::StaleEpoch {
                thread_id: self.thread_id,
            }),
        }
    }
}

/// Keeps a session attached to its change feed.
///
/// The server closes feeds that lag or miss heartbeats. On a remote close the
/// feed is resubscribed with doubling backoff and recent history is re-read,
/// since writes made while detached were never pushed.
struct FeedFollower {
    reconciler: FeedReconciler,
    backend: Arc<dyn ThreadBackend>,
    loader: Arc<PageLoader>,
    retry: Duration,
    retry_max: Duration,
}

impl FeedFollower {
    async fn run(self, mut feed: FeedStream) {
        let thread_id = self.loader.thread_id();
        loop {
            if self.reconciler.run(feed).await == FeedEnd::Detached {
                return;
            }
            feed = match self.resubscribe().await {
                Some(feed) => feed,
                None => return,
            };
            if !self.catch_up().await {
                return;
            }
            info!(%thread_id, "change feed reattached");
        }
    }

    /// `None` once the session has closed.
    async fn resubscribe(&self) -> Option<FeedStream> {
        let thread_id = self.loader.thread_id();
        let mut delay = self.retry;
        loop {
            tokio::time::sleep(delay).await;
            if !self.loader.is_current() {
                return None;
            }
            match self.backend.subscribe(thread_id).await {
                Ok(feed) => return Some(feed),
                Err(e) => {
                    warn!(%thread_id, retry_in = ?delay, "change feed resubscribe failed: {}", e);
                    delay = (delay * 2).min(self.retry_max);
                }
            }
        }
    }

    /// `false` once the session has closed.
    async fn catch_up(&self) -> bool {
        let thread_id = self.loader.thread_id();
        let mut delay = self.retry;
        loop {
            match self.loader.catch_up().await {
                Ok(_) => return true,
                Err(SyncError::StaleEpoch { .. }) => return false,
                Err(e) => {
                    warn!(%thread_id, retry_in = ?delay, "catch-up after feed gap failed: {}", e);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry_max);
                }
            }
        }
    }
}

impl Drop for ThreadSession {
    fn drop(&mut self) {
        self.close();
    }
}
