pub mod error;
pub mod feed;
pub mod messages;
pub mod middleware;
pub mod state;
pub mod threads;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, patch},
};

pub use state::{AppState, AppStateInner};

/// Every thread route. Callers add transport layers (CORS, tracing).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/threads/{thread_id}", get(threads::get_thread))
        .route(
            "/threads/{thread_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/threads/{thread_id}/feed", get(feed::feed_upgrade))
        .route("/messages/{message_id}", patch(messages::update_message))
        .layer(axum_middleware::from_fn(middleware::require_identity))
        .with_state(state)
}
