//! In-memory backend for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use atelier_types::api::{PageResponse, WireMessage, WirePatch};
use atelier_types::events::ChangeEvent;
use atelier_types::models::{
    Attachment, Cursor, Message, MessageId, MessagePatch, ThreadId,
};

use crate::backend::{FeedStream, ThreadBackend};
use crate::config::Identity;
use crate::error::{BackendError, BackendErrorKind};

pub const THREAD: ThreadId = Uuid::from_u128(0xA7);
pub const ME: Uuid = Uuid::from_u128(0xE);

pub fn identity() -> Identity {
    Identity::new(ME, Some("ines".into()))
}

pub fn message(secs: i64, id: u128) -> Message {
    Message {
        id: Uuid::from_u128(id),
        thread_id: THREAD,
        author_id: Uuid::from_u128(0xB0B),
        created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        content: format!("note {}", id),
        attachments: vec![],
        reactions: vec![],
        edited_at: None,
        tombstoned: false,
    }
}

/// `n` messages, oldest first, with timestamp ties every three rows.
pub fn history(n: u128) -> Vec<Message> {
    (1..=n).map(|i| message(1_000 + (i / 3) as i64, i)).collect()
}

#[derive(Default)]
struct State {
    messages: Vec<Message>,
    fetch_cursors: Vec<Option<Cursor>>,
    fail_fetch: VecDeque<BackendError>,
    fail_create: VecDeque<BackendError>,
    fail_update: VecDeque<BackendError>,
    updates: Vec<MessagePatch>,
    feeds: Vec<mpsc::UnboundedSender<ChangeEvent>>,
    next_id: u128,
    update_delay: Option<Duration>,
}

/// Behaves like the HTTP API over a `Vec`, minus persistence.
pub struct TestBackend {
    state: Mutex<State>,
    echo: bool,
}

impl TestBackend {
    pub fn with_history(messages: Vec<Message>) -> Self {
        Self {
            state: Mutex::new(State {
                messages,
                next_id: 0x1000,
                ..State::default()
            }),
            echo: false,
        }
    }

    /// Also broadcast writes to open feeds, as the server does.
    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn fetch_cursors(&self) -> Vec<Option<Cursor>> {
        self.state.lock().unwrap().fetch_cursors.clone()
    }

    pub fn updates(&self) -> Vec<MessagePatch> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn server_message(&self, id: MessageId) -> Option<Message> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn fail_next_fetch(&self, err: BackendError) {
        self.state.lock().unwrap().fail_fetch.push_back(err);
    }

    pub fn fail_next_create(&self, err: BackendError) {
        self.state.lock().unwrap().fail_create.push_back(err);
    }

    pub fn fail_next_update(&self, err: BackendError) {
        self.state.lock().unwrap().fail_update.push_back(err);
    }

    pub fn delay_updates(&self, delay: Duration) {
        self.state.lock().unwrap().update_delay = Some(delay);
    }

    /// A write that reached the server but no feed.
    pub fn record(&self, message: Message) {
        self.state.lock().unwrap().messages.push(message);
    }

    /// Close every open feed, as the server does on lag or a missed heartbeat.
    pub fn drop_feeds(&self) {
        self.state.lock().unwrap().feeds.clear();
    }

    pub fn push(&self, event: ChangeEvent) {
        let mut state = self.state.lock().unwrap();
        state.feeds.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.feeds.retain(|tx| !tx.is_closed());
        state.feeds.len()
    }
}

#[async_trait]
impl ThreadBackend for TestBackend {
    async fn fetch_page(
        &self,
        thread_id: ThreadId,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> Result<PageResponse, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.fetch_cursors.push(cursor);
        if let Some(err) = state.fail_fetch.pop_front() {
            return Err(err);
        }

        let mut older: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.thread_id == thread_id)
            .filter(|m| cursor.is_none_or(|c| m.sort_key() < c))
            .collect();
        older.sort_by_key(|m| m.sort_key());
        let start = older.len().saturating_sub(limit as usize);
        let messages: Vec<WireMessage> = older[start..].iter().map(|m| WireMessage::from(*m)).collect();

        let next_cursor = if messages.len() == limit as usize {
            older.get(start).map(|m| m.sort_key())
        } else {
            None
        };
        Ok(PageResponse {
            messages,
            next_cursor,
        })
    }

    async fn subscribe(&self, _thread_id: ThreadId) -> Result<FeedStream, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().feeds.push(tx);
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }

    async fn create_message(
        &self,
        thread_id: ThreadId,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<WireMessage, BackendError> {
        let wire = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.fail_create.pop_front() {
                return Err(err);
            }
            state.next_id += 1;
            let message = Message {
                id: Uuid::from_u128(state.next_id),
                thread_id,
                author_id: ME,
                created_at: Utc::now(),
                content: content.to_string(),
                attachments: attachments.to_vec(),
                reactions: vec![],
                edited_at: None,
                tombstoned: false,
            };
            state.messages.push(message.clone());
            WireMessage::from(&message)
        };
        if self.echo {
            self.push(ChangeEvent::Insert {
                message: wire.clone(),
            });
        }
        Ok(wire)
    }

    async fn update_message(
        &self,
        id: MessageId,
        patch: &MessagePatch,
    ) -> Result<WireMessage, BackendError> {
        let delay = self.state.lock().unwrap().update_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let wire = {
            let mut state = self.state.lock().unwrap();
            state.updates.push(patch.clone());
            if let Some(err) = state.fail_update.pop_front() {
                return Err(err);
            }
            let Some(message) = state.messages.iter_mut().find(|m| m.id == id) else {
                return Err(BackendError::new(BackendErrorKind::NotFound, "no such message"));
            };
            if message.tombstoned {
                return Err(BackendError::new(BackendErrorKind::Conflict, "message was deleted"));
            }
            message.apply_patch(&MessagePatch {
                edited_at: None,
                ..patch.clone()
            });
            if patch.content.is_some() {
                message.edited_at = Some(Utc::now());
            }
            WireMessage::from(&*message)
        };
        if self.echo {
            self.push(ChangeEvent::Update {
                thread_id: wire.thread_id,
                patch: WirePatch::from(&wire),
            });
        }
        Ok(wire)
    }
}
