use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use atelier_types::models::{Cursor, Page, ThreadId};

use crate::backend::ThreadBackend;
use crate::error::SyncError;
use crate::ingest;
use crate::lane::{Epoch, Lane};

#[derive(Debug, Clone, Copy)]
struct PageMeta {
    len: usize,
    limit: u32,
    cursor: Option<Cursor>,
}

/// Backward pagination for one thread.
///
/// Loads are serialized, so a second `load_more` waits for the first and
/// continues from the cursor it produced.
pub struct PageLoader {
    backend: Arc<dyn ThreadBackend>,
    lane: Arc<Lane>,
    epoch: Epoch,
    page_size: u32,
    gate: tokio::sync::Mutex<()>,
    last: Mutex<Option<PageMeta>>,
}

impl PageLoader {
    pub fn new(backend: Arc<dyn ThreadBackend>, lane: Arc<Lane>, epoch: Epoch, page_size: u32) -> Self {
        Self {
            backend,
            lane,
            epoch,
            page_size,
            gate: tokio::sync::Mutex::new(()),
            last: Mutex::new(None),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.lane.thread_id()
    }

    pub fn is_current(&self) -> bool {
        self.lane.is_current(self.epoch)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Whether older history may exist: the last page came back full.
    /// `false` until something has been loaded.
    pub fn has_more(&self) -> bool {
        self.last_meta()
            .is_some_and(|meta| meta.len as u64 == u64::from(meta.limit))
    }

    /// Newest page of the thread.
    pub async fn load_initial(&self) -> Result<Page, SyncError> {
        let _gate = self.gate.lock().await;
        self.fetch(None).await
    }

    /// The page strictly older than `cursor`.
    pub async fn load_older(&self, cursor: Cursor) -> Result<Page, SyncError> {
        let _gate = self.gate.lock().await;
        self.fetch(Some(cursor)).await
    }

    /// Continue from where the previous load stopped. `Ok(None)` when the
    /// history is exhausted.
    pub async fn load_more(&self) -> Result<Option<Page>, SyncError> {
        let _gate = self.gate.lock().await;
        match self.last_meta() {
            None => self.fetch(None).await.map(Some),
            Some(meta) if meta.len as u64 == u64::from(meta.limit) => match meta.cursor {
                Some(cursor) => self.fetch(Some(cursor)).await.map(Some),
                None => Ok(None),
            },
            Some(_) => Ok(None),
        }
    }

    /// Re-read recent history after the change feed was interrupted.
    ///
    /// Walks back from the newest page until a page overlaps what the store
    /// already held, or history ends. The `load_more` position is untouched.
    pub async fn catch_up(&self) -> Result<usize, SyncError> {
        let _gate = self.gate.lock().await;
        let was_empty = self.lane.snapshot().is_empty();
        let mut cursor = None;
        let mut inserted = 0;

        loop {
            let page = self.request(cursor).await?;
            let overlaps = page.messages.iter().any(|m| self.lane.get(m.id).is_some());
            inserted += self.lane.merge(self.epoch, page.messages.clone())?.inserted.len();
            match page.cursor() {
                Some(next) if page.is_full() && !overlaps && !was_empty => cursor = Some(next),
                _ => break,
            }
        }

        debug!(thread_id = %self.lane.thread_id(), inserted, "caught up after feed gap");
        Ok(inserted)
    }

    async fn request(&self, cursor: Option<Cursor>) -> Result<Page, SyncError> {
        let thread_id = self.lane.thread_id();
        self.lane.check(self.epoch)?;

        let response = self
            .backend
            .fetch_page(thread_id, cursor, self.page_size)
            .await
            .map_err(|e| {
                warn!(%thread_id, "page fetch failed: {}", e);
                SyncError::from_backend(e, None)
            })?;

        Ok(Page {
            messages: ingest::messages(response.messages),
            limit: self.page_size,
        })
    }

    async fn fetch(&self, cursor: Option<Cursor>) -> Result<Page, SyncError> {
        let page = self.request(cursor).await?;
        let result = self.lane.merge(self.epoch, page.messages.clone())?;

        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(PageMeta {
            len: page.messages.len(),
            limit: page.limit,
            cursor: page.cursor(),
        });

        debug!(
            thread_id = %self.lane.thread_id(),
            fetched = page.messages.len(),
            inserted = result.inserted.len(),
            patched = result.patched.len(),
            has_more = page.is_full(),
            "page merged"
        );
        Ok(page)
    }

    fn last_meta(&self) -> Option<PageMeta> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use crate::config::SyncConfig;
    use crate::error::BackendError;
    use crate::testing::{THREAD, TestBackend, history, message};

    fn loader(backend: Arc<TestBackend>, page_size: u32) -> (PageLoader, Arc<Lane>) {
        let (tx, _) = broadcast::channel(16);
        let lane = Arc::new(Lane::new(THREAD, 0, &SyncConfig::default(), tx));
        (PageLoader::new(backend, lane.clone(), 0, page_size), lane)
    }

    #[tokio::test]
    async fn full_page_means_more_history() {
        let backend = Arc::new(TestBackend::with_history(history(20)));
        let (loader, lane) = loader(backend, 20);
        assert!(!loader.has_more());

        let page = loader.load_initial().await.unwrap();
        assert_eq!(page.messages.len(), 20);
        assert!(loader.has_more());
        assert_eq!(lane.snapshot().len(), 20);

        // The next page is empty and closes the history.
        assert_eq!(loader.load_more().await.unwrap().map(|p| p.messages.len()), Some(0));
        assert!(!loader.has_more());
        assert!(loader.load_more().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_page_ends_history() {
        let backend = Arc::new(TestBackend::with_history(history(5)));
        let (loader, _lane) = loader(backend, 20);
        loader.load_initial().await.unwrap();
        assert!(!loader.has_more());
    }

    #[tokio::test]
    async fn paging_back_has_no_gap_or_duplicate() {
        let all = history(45);
        let backend = Arc::new(TestBackend::with_history(all.clone()));
        let (loader, lane) = loader(backend, 20);

        loader.load_initial().await.unwrap();
        while loader.has_more() {
            loader.load_more().await.unwrap();
        }

        let expected: Vec<Uuid> = all.iter().map(|m| m.id).collect();
        assert_eq!(lane.snapshot().ids(), expected);
    }

    #[tokio::test]
    async fn concurrent_load_more_runs_in_sequence() {
        let backend = Arc::new(TestBackend::with_history(history(60)));
        let (loader, lane) = loader(backend.clone(), 20);
        loader.load_initial().await.unwrap();

        let (a, b) = tokio::join!(loader.load_more(), loader.load_more());
        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());
        assert_eq!(lane.snapshot().len(), 60);

        let cursors = backend.fetch_cursors();
        assert_eq!(cursors.len(), 3);
        assert_ne!(cursors[1], cursors[2]);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_store_untouched() {
        let backend = Arc::new(TestBackend::with_history(history(30)));
        let (loader, lane) = loader(backend.clone(), 20);
        loader.load_initial().await.unwrap();
        let before = lane.snapshot();

        backend.fail_next_fetch(BackendError::network("connection reset"));
        let err = loader.load_more().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(lane.snapshot().version(), before.version());
        assert!(loader.has_more());

        // Retry continues from the same cursor.
        loader.load_more().await.unwrap();
        assert_eq!(lane.snapshot().len(), 30);
    }

    #[tokio::test]
    async fn refetching_a_page_changes_nothing() {
        let backend = Arc::new(TestBackend::with_history(history(10)));
        let (loader, lane) = loader(backend, 20);
        loader.load_initial().await.unwrap();
        let version = lane.snapshot().version();
        loader.load_initial().await.unwrap();
        assert_eq!(lane.snapshot().version(), version);
    }

    #[tokio::test]
    async fn catch_up_fills_the_gap_without_moving_the_paging_cursor() {
        let backend = Arc::new(TestBackend::with_history(history(45)));
        let (loader, lane) = loader(backend.clone(), 20);
        loader.load_initial().await.unwrap();

        for i in 0..25 {
            backend.record(message(5_000 + i, 0x500 + i as u128));
        }
        assert_eq!(loader.catch_up().await.unwrap(), 25);
        assert_eq!(lane.snapshot().len(), 45);
        assert!(loader.has_more());

        // Older history still continues below the first page.
        loader.load_more().await.unwrap();
        assert_eq!(lane.snapshot().len(), 65);
    }
}
