use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use atelier_types::models::ThreadId;

use crate::backend::ThreadBackend;
use crate::config::{Identity, SyncConfig};
use crate::error::SyncError;
use crate::lane::StoreChange;
use crate::session::ThreadSession;

struct Entry {
    session: Arc<ThreadSession>,
    refs: usize,
}

/// Open sessions keyed by thread id, shared by reference count.
///
/// Every holder of a [`ThreadHandle`] for a thread sees the same store and
/// the same single change-feed subscription. The last handle to go closes
/// the session.
pub struct SessionRegistry {
    backend: Arc<dyn ThreadBackend>,
    identity: Identity,
    config: SyncConfig,
    changes: broadcast::Sender<StoreChange>,
    epochs: AtomicU64,
    sessions: Mutex<HashMap<ThreadId, Entry>>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn ThreadBackend>,
        identity: Identity,
        config: SyncConfig,
        changes: broadcast::Sender<StoreChange>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            identity,
            config: config.normalized(),
            changes,
            epochs: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Take a reference to the session for `thread_id`, opening it if needed.
    pub async fn acquire(self: &Arc<Self>, thread_id: ThreadId) -> Result<ThreadHandle, SyncError> {
        if let Some(handle) = self.retain(thread_id) {
            return Ok(handle);
        }

        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let session = ThreadSession::open(
            thread_id,
            epoch,
            self.backend.clone(),
            self.identity.clone(),
            &self.config,
            self.changes.clone(),
        )
        .await?;

        let mut sessions = self.lock();
        if let Some(entry) = sessions.get_mut(&thread_id) {
            // Another caller opened it while we were loading.
            entry.refs += 1;
            let existing = entry.session.clone();
            drop(sessions);
            debug!(%thread_id, "concurrent open, keeping the first session");
            session.close();
            return Ok(self.handle(existing));
        }
        sessions.insert(
            thread_id,
            Entry {
                session: session.clone(),
                refs: 1,
            },
        );
        Ok(self.handle(session))
    }

    /// The open session for `thread_id`, without taking a reference.
    pub fn get(&self, thread_id: ThreadId) -> Option<Arc<ThreadSession>> {
        self.lock().get(&thread_id).map(|e| e.session.clone())
    }

    pub fn ref_count(&self, thread_id: ThreadId) -> usize {
        self.lock().get(&thread_id).map_or(0, |e| e.refs)
    }

    pub fn open_threads(&self) -> Vec<ThreadId> {
        self.lock().keys().copied().collect()
    }

    fn retain(self: &Arc<Self>, thread_id: ThreadId) -> Option<ThreadHandle> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(&thread_id)?;
        entry.refs += 1;
        let session = entry.session.clone();
        drop(sessions);
        Some(self.handle(session))
    }

    fn release(&self, session: &Arc<ThreadSession>) {
        let thread_id = session.thread_id();
        let mut sessions = self.lock();
        let Some(entry) = sessions.get_mut(&thread_id) else {
            return;
        };
        if !Arc::ptr_eq(&entry.session, session) {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        let removed = sessions.remove(&thread_id);
        drop(sessions);
        if let Some(entry) = removed {
            debug!(%thread_id, "last handle released");
            entry.session.close();
        }
    }

    fn handle(self: &Arc<Self>, session: Arc<ThreadSession>) -> ThreadHandle {
        ThreadHandle {
            registry: self.clone(),
            session,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A counted reference to an open thread session.
pub struct ThreadHandle {
    registry: Arc<SessionRegistry>,
    session: Arc<ThreadSession>,
}

impl ThreadHandle {
    pub fn session(&self) -> &Arc<ThreadSession> {
        &self.session
    }
}

impl Deref for ThreadHandle {
    type Target = ThreadSession;

    fn deref(&self) -> &ThreadSession {
        &self.session
    }
}

impl Clone for ThreadHandle {
    fn clone(&self) -> Self {
        let mut sessions = self.registry.lock();
        if let Some(entry) = sessions.get_mut(&self.session.thread_id()) {
            if Arc::ptr_eq(&entry.session, &self.session) {
                entry.refs += 1;
            }
        }
        drop(sessions);
        Self {
            registry: self.registry.clone(),
            session: self.session.clone(),
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.registry.release(&self.session);
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("thread_id", &self.session.thread_id())
            .field("epoch", &self.session.epoch())
            .finish()
    }
}
