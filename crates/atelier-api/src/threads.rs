use std::collections::BTreeSet;

use axum::{
    Json,
    extract::{Path, State},
};
use tracing::warn;
use uuid::Uuid;

use atelier_types::models::Thread;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> Result<Json<Thread>, ApiError> {
    let db = state.clone();
    let row = tokio::task::spawn_blocking(move || db.db.get_thread(&thread_id.to_string()))
        .await??
        .ok_or_else(|| ApiError::NotFound(format!("thread {} not found", thread_id)))?;

    let participant_ids: BTreeSet<Uuid> = row
        .participant_ids
        .iter()
        .filter_map(|raw| match raw.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Corrupt participant id '{}' on thread '{}': {}", raw, row.id, e);
                None
            }
        })
        .collect();

    Ok(Json(Thread {
        id: thread_id,
        topic: row.topic,
        participant_ids,
        created_at: chrono::DateTime::from_timestamp_micros(row.created_at).unwrap_or_default(),
    }))
}
