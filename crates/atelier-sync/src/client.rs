use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use atelier_types::models::{Attachment, Message, MessageId, ThreadId};

use crate::backend::ThreadBackend;
use crate::config::{Identity, SyncConfig};
use crate::error::SyncError;
use crate::lane::StoreChange;
use crate::mutation::PendingMutation;
use crate::registry::{SessionRegistry, ThreadHandle};
use crate::session::ThreadSession;
use crate::remote::HttpBackend;
use crate::store::Snapshot;

const CHANGE_CAPACITY: usize = 256;

/// UI-facing entry point of the engine.
///
/// Operations are keyed by thread id and act on that thread's open session;
/// calling one for a thread that is not open fails with
/// [`SyncError::NotOpen`]. Work that outlives its session resolves to nothing
/// instead of an error: `load_more` returns `Ok(())` and mutations return
/// `Ok(None)`.
#[derive(Clone)]
pub struct SyncClient {
    registry: Arc<SessionRegistry>,
    changes: broadcast::Sender<StoreChange>,
}

impl SyncClient {
    pub fn new(backend: Arc<dyn ThreadBackend>, identity: Identity, config: SyncConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        info!(user_id = %identity.user_id, page_size = config.page_size, "sync client ready");
        Self {
            registry: SessionRegistry::new(backend, identity, config, changes.clone()),
            changes,
        }
    }

    /// Talk to an Atelier server at `base_url`.
    pub fn connect(
        base_url: &str,
        identity: Identity,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let backend = HttpBackend::new(base_url, identity.clone())?;
        Ok(Self::new(Arc::new(backend), identity, config))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open `thread_id`, or join its existing session.
    pub async fn open(&self, thread_id: ThreadId) -> Result<ThreadHandle, SyncError> {
        self.registry.acquire(thread_id).await
    }

    /// A view that owns one displayed thread at a time.
    pub fn view(&self) -> ThreadView {
        ThreadView {
            client: self.clone(),
            current: None,
        }
    }

    /// Notifications fired after every write that changed a store.
    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// `None` when the thread is not open.
    pub fn snapshot(&self, thread_id: ThreadId) -> Option<Snapshot> {
        self.registry.get(thread_id).map(|s| s.snapshot())
    }

    pub fn has_more(&self, thread_id: ThreadId) -> bool {
        self.registry
            .get(thread_id)
            .is_some_and(|s| s.has_more())
    }

    pub fn pending(&self, thread_id: ThreadId) -> Vec<PendingMutation> {
        self.registry
            .get(thread_id)
            .map(|s| s.pending())
            .unwrap_or_default()
    }

    fn session(&self, thread_id: ThreadId) -> Result<Arc<ThreadSession>, SyncError> {
        self.registry.get(thread_id).ok_or(SyncError::NotOpen(thread_id))
    }

    pub async fn load_more(&self, thread_id: ThreadId) -> Result<(), SyncError> {
        let session = self.session(thread_id)?;
        settle(session.load_more().await).map(|_| ())
    }

    pub async fn send(
        &self,
        thread_id: ThreadId,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Option<Message>, SyncError> {
        let session = self.session(thread_id)?;
        settle(session.send(content.into(), attachments).await)
    }

    pub async fn edit(
        &self,
        thread_id: ThreadId,
        id: MessageId,
        content: impl Into<String>,
        attachments: Option<Vec<Attachment>>,
    ) -> Result<Option<Message>, SyncError> {
        let session = self.session(thread_id)?;
        settle(session.edit(id, content.into(), attachments).await)
    }

    pub async fn delete(
        &self,
        thread_id: ThreadId,
        id: MessageId,
    ) -> Result<Option<Message>, SyncError> {
        let session = self.session(thread_id)?;
        settle(session.delete(id).await)
    }

    pub async fn react(
        &self,
        thread_id: ThreadId,
        id: MessageId,
        reaction: impl Into<String>,
    ) -> Result<Option<Message>, SyncError> {
        let session = self.session(thread_id)?;
        settle(session.react(id, reaction.into()).await)
    }
}

/// Swallow results of work whose session has closed.
fn settle<T>(result: Result<T, SyncError>) -> Result<Option<T>, SyncError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(SyncError::StaleEpoch { thread_id }) => {
            debug!(%thread_id, "discarding result from a closed session");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// The thread currently on screen.
///
/// Switching acquires the new thread before releasing the old one, so
/// flipping back and forth between two threads never tears a session down
/// that another holder still uses.
pub struct ThreadView {
    client: SyncClient,
    current: Option<ThreadHandle>,
}

impl ThreadView {
    pub fn current(&self) -> Option<ThreadId> {
        self.current.as_ref().map(|h| h.thread_id())
    }

    pub fn handle(&self) -> Option<&ThreadHandle> {
        self.current.as_ref()
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.current.as_ref().map(|h| h.snapshot())
    }

    /// Display `thread_id`. A failed open leaves the current thread shown.
    pub async fn show(&mut self, thread_id: ThreadId) -> Result<(), SyncError> {
        if self.current() == Some(thread_id) {
            return Ok(());
        }
        let next = self.client.open(thread_id).await?;
        if let Some(previous) = self.current.replace(next) {
            debug!(from = %previous.thread_id(), to = %thread_id, "switched thread");
        }
        Ok(())
    }

    /// Stop displaying anything.
    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, BackendErrorKind};
    use crate::testing::{THREAD, TestBackend, history, identity};
    use uuid::Uuid;

    fn client(backend: Arc<TestBackend>) -> SyncClient {
        SyncClient::new(backend, identity(), SyncConfig::default())
    }

    #[tokio::test]
    async fn switching_threads_closes_the_previous_one() {
        let backend = Arc::new(TestBackend::with_history(history(3)));
        let client = client(backend.clone());
        let mut view = client.view();

        view.show(THREAD).await.unwrap();
        let first = view.handle().unwrap().session().clone();

        let other = Uuid::from_u128(0xBEEF);
        view.show(other).await.unwrap();
        assert_eq!(view.current(), Some(other));
        assert!(first.is_closed());
        assert!(client.snapshot(THREAD).is_none());
    }

    #[tokio::test]
    async fn switching_keeps_sessions_others_hold() {
        let backend = Arc::new(TestBackend::with_history(history(3)));
        let client = client(backend);
        let pinned = client.open(THREAD).await.unwrap();
        let mut view = client.view();

        view.show(THREAD).await.unwrap();
        view.show(Uuid::from_u128(0xBEEF)).await.unwrap();
        assert!(!pinned.is_closed());
        assert_eq!(client.snapshot(THREAD).map(|s| s.len()), Some(3));
    }

    #[tokio::test]
    async fn changes_are_published() {
        let backend = Arc::new(TestBackend::with_history(history(3)));
        let client = client(backend);
        let mut changes = client.changes();
        let _handle = client.open(THREAD).await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.thread_id, THREAD);
        assert_eq!(change.inserted.len(), 3);
    }

    #[tokio::test]
    async fn operations_on_unopened_threads_are_refused() {
        let backend = Arc::new(TestBackend::with_history(history(3)));
        let client = client(backend.clone());

        let err = client.send(THREAD, "hi", vec![]).await.unwrap_err();
        assert_eq!(err, SyncError::NotOpen(THREAD));
        assert!(!err.is_user_facing());
        assert_eq!(
            client.load_more(THREAD).await.unwrap_err(),
            SyncError::NotOpen(THREAD)
        );
        assert!(!client.has_more(THREAD));
        assert!(backend.server_message(Uuid::from_u128(0x1001)).is_none());

        // Once released, the thread is closed again.
        drop(client.open(THREAD).await.unwrap());
        let err = client.react(THREAD, Uuid::from_u128(1), "👍").await.unwrap_err();
        assert_eq!(err, SyncError::NotOpen(THREAD));
    }

    #[tokio::test]
    async fn user_facing_errors_pass_through() {
        let backend = Arc::new(TestBackend::with_history(history(3)));
        let client = client(backend.clone());
        let _handle = client.open(THREAD).await.unwrap();

        backend.fail_next_update(BackendError::new(BackendErrorKind::NotFound, "gone"));
        let id = Uuid::from_u128(2);
        let err = client.react(THREAD, id, "👍").await.unwrap_err();
        assert_eq!(err, SyncError::NotFound(id));
        assert!(err.is_user_facing());
    }
}
