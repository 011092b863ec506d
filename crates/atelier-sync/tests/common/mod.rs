#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use uuid::Uuid;

use atelier_api::AppStateInner;
use atelier_db::Database;
use atelier_gateway::dispatcher::Dispatcher;
use atelier_sync::{Identity, SyncClient, SyncConfig};

/// A real API server on a loopback port, backed by an in-memory database.
pub struct TestServer {
    pub base_url: String,
    pub dispatcher: Dispatcher,
}

impl TestServer {
    pub async fn start() -> Self {
        let dispatcher = Dispatcher::new(256);
        let state = Arc::new(AppStateInner {
            db: Database::open_in_memory().unwrap(),
            dispatcher: dispatcher.clone(),
        });
        let app = atelier_api::router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            dispatcher,
        }
    }

    pub fn client(&self, user: u128, name: &str, page_size: u32) -> SyncClient {
        let identity = Identity::new(Uuid::from_u128(user), Some(name.to_string()));
        let config = SyncConfig {
            page_size,
            ..SyncConfig::default()
        };
        SyncClient::connect(&self.base_url, identity, config).unwrap()
    }

    /// Wait until `n` feeds are attached to `thread_id` server-side.
    pub async fn wait_for_feeds(&self, thread_id: Uuid, n: usize) {
        let dispatcher = self.dispatcher.clone();
        eventually(move || {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.watcher_count(thread_id).await >= n }
        })
        .await;
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier_sync=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
