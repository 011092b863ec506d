//! The seam between the engine and whatever hosts the messages.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use atelier_types::api::{PageResponse, WireMessage};
use atelier_types::events::ChangeEvent;
use atelier_types::models::{Attachment, Cursor, MessageId, MessagePatch, ThreadId};

use crate::error::BackendError;

/// Push channel for one thread. Dropping it unsubscribes.
pub type FeedStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// Remote collaborator consumed by the engine.
///
/// Payloads come back in wire shape; the engine validates them on ingestion.
#[async_trait]
pub trait ThreadBackend: Send + Sync {
    /// Up to `limit` messages strictly older than `cursor` (newest history
    /// when `None`), oldest first.
    async fn fetch_page(
        &self,
        thread_id: ThreadId,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> Result<PageResponse, BackendError>;

    /// Open the change feed for `thread_id`.
    async fn subscribe(&self, thread_id: ThreadId) -> Result<FeedStream, BackendError>;

    async fn create_message(
        &self,
        thread_id: ThreadId,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<WireMessage, BackendError>;

    async fn update_message(
        &self,
        id: MessageId,
        patch: &MessagePatch,
    ) -> Result<WireMessage, BackendError>;
}
