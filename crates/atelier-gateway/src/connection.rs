use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use atelier_types::events::ChangeEvent;

use crate::dispatcher::Dispatcher;

/// A Ping goes out this often.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Consecutive unanswered Pings before the feed is dropped (~30s).
const MAX_MISSED_PONGS: u8 = 2;

/// Liveness of the peer, fed by the receive half and checked by the send half.
#[derive(Clone)]
struct Liveness {
    answered: Arc<AtomicBool>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            answered: Arc::new(AtomicBool::new(true)),
        }
    }

    fn pong(&self) {
        self.answered.store(true, Ordering::Release);
    }

    /// Called on each heartbeat tick. Returns the updated miss count.
    fn check(&self, missed: u8) -> u8 {
        if self.answered.swap(false, Ordering::AcqRel) {
            0
        } else {
            missed.saturating_add(1)
        }
    }
}

fn encode(event: &ChangeEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!(message_id = %event.message_id(), "change event not encodable: {}", e);
            None
        }
    }
}

/// Serve one change-feed WebSocket for `thread_id` until either side hangs up.
///
/// The feed is push-only: inbound frames are read solely for Pong/Close.
pub async fn handle_feed(socket: WebSocket, dispatcher: Dispatcher, thread_id: Uuid, user_id: Uuid) {
    let (mut sink, mut stream) = socket.split();

    // Subscribe before announcing so nothing broadcast in between is missed.
    let mut events = dispatcher.subscribe();
    let watchers = dispatcher.watch(thread_id).await;
    info!(%thread_id, %user_id, watchers, "feed connected");

    let liveness = Liveness::new();
    let peer = liveness.clone();

    let mut push = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        let mut missed = 0u8;

        loop {
            let frame = tokio::select! {
                received = events.recv() => match received {
                    Ok(event) if event.thread_id() == thread_id => {
                        debug!(%thread_id, message_id = %event.message_id(), "forwarding change event");
                        match encode(&event) {
                            Some(frame) => frame,
                            None => continue,
                        }
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        // The feed now has a gap. Close so the client resubscribes.
                        warn!(%thread_id, skipped = n, "feed lagged, closing");
                        break;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    missed = liveness.check(missed);
                    if missed >= MAX_MISSED_PONGS {
                        warn!(%thread_id, missed, "no pong from feed peer, dropping");
                        break;
                    }
                    Message::Ping(Vec::new().into())
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut listen = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                Message::Pong(_) => peer.pong(),
                Message::Close(_) => break,
                Message::Text(text) => {
                    debug!(%thread_id, "ignoring inbound feed frame ({} bytes)", text.len());
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut push => listen.abort(),
        _ = &mut listen => push.abort(),
    }

    let remaining = dispatcher.unwatch(thread_id).await;
    info!(%thread_id, %user_id, remaining, "feed disconnected");
}
