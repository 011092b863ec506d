use axum::{
    Extension,
    extract::{Path, State, WebSocketUpgrade},
    response::IntoResponse,
};
use uuid::Uuid;

use atelier_gateway::connection;

use crate::middleware::Identity;
use crate::state::AppState;

pub async fn feed_upgrade(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    ws.on_upgrade(move |socket| {
        connection::handle_feed(socket, dispatcher, thread_id, identity.user_id)
    })
}
