use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use atelier_types::api::{
    CreateMessageRequest, PageQuery, PageResponse, UpdateMessageRequest, WireMessage, WirePatch,
};
use atelier_types::events::ChangeEvent;
use atelier_types::models::{Cursor, Message};
use atelier_types::validate;

use crate::error::ApiError;
use crate::middleware::Identity;
use crate::state::AppState;

/// Hard cap on page size regardless of what the client asks for.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Current time truncated to the microsecond precision the store keeps, so
/// what a client receives from a write equals what later reads return.
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<Json<PageResponse>, ApiError> {
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
    let cursor = query.cursor();

    // Run blocking DB queries off the async runtime
    let db = state.clone();
    let messages = tokio::task::spawn_blocking(move || {
        let tid = thread_id.to_string();
        db.db.ensure_thread(&tid, now_micros())?;
        let cursor_id = cursor.map(|c| c.id.to_string());
        let before = cursor
            .zip(cursor_id.as_deref())
            .map(|(c, id)| (c.created_at.timestamp_micros(), id));
        db.db.get_page(&tid, before, limit)
    })
    .await??;

    let next_cursor = if messages.len() as u32 == limit {
        messages.first().map(|m| Cursor {
            created_at: m.created_at,
            id: m.id,
        })
    } else {
        None
    };

    debug!(%thread_id, count = messages.len(), limit, "served page");
    Ok(Json(PageResponse {
        messages,
        next_cursor,
    }))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let attachments = validate::attachments(&req.attachments);
    for issue in &attachments.issues {
        debug!(%thread_id, "inbound message: {}", issue);
    }
    if req.content.trim().is_empty() && attachments.value.is_empty() {
        return Err(ApiError::BadRequest(
            "message needs content or at least one attachment".into(),
        ));
    }

    let message = Message {
        id: Uuid::new_v4(),
        thread_id,
        author_id: identity.user_id,
        created_at: now_micros(),
        content: req.content,
        attachments: attachments.value,
        reactions: vec![],
        edited_at: None,
        tombstoned: false,
    };

    let db = state.clone();
    let row = message.clone();
    tokio::task::spawn_blocking(move || {
        let tid = row.thread_id.to_string();
        db.db.ensure_thread(&tid, row.created_at)?;
        db.db.add_participant(&tid, &row.author_id.to_string())?;
        db.db.insert_message(&row)
    })
    .await??;

    let wire = WireMessage::from(&message);
    state.dispatcher.broadcast(ChangeEvent::Insert {
        message: wire.clone(),
    });

    Ok((StatusCode::CREATED, Json(wire)))
}

pub async fn update_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<UpdateMessageRequest>,
) -> Result<Json<WireMessage>, ApiError> {
    let patch = validate::patch(req.into_patch(message_id));
    for issue in &patch.issues {
        debug!(%message_id, "inbound patch: {}", issue);
    }
    let patch = patch.value;
    if patch.is_empty() {
        return Err(ApiError::BadRequest("empty update".into()));
    }

    let db = state.clone();
    let updated = tokio::task::spawn_blocking(move || {
        db.db
            .update_message(&message_id.to_string(), &patch, now_micros())
    })
    .await??;

    debug!(%message_id, user_id = %identity.user_id, "message updated");
    state.dispatcher.broadcast(ChangeEvent::Update {
        thread_id: updated.thread_id,
        patch: WirePatch::from(&updated),
    });

    Ok(Json(updated))
}
