use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use atelier_api::AppStateInner;
use atelier_gateway::dispatcher::Dispatcher;

struct ServerConfig {
    host: String,
    port: u16,
    db_path: PathBuf,
    feed_capacity: usize,
}

impl ServerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("ATELIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = std::env::var("ATELIER_PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .context("ATELIER_PORT")?;
        let db_path = std::env::var("ATELIER_DB_PATH").unwrap_or_else(|_| "atelier.db".into());
        let feed_capacity = std::env::var("ATELIER_FEED_CAPACITY")
            .unwrap_or_else(|_| "1024".into())
            .parse()
            .context("ATELIER_FEED_CAPACITY")?;

        Ok(Self {
            host,
            port,
            db_path: PathBuf::from(db_path),
            feed_capacity,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "atelier=debug,atelier_sync=debug,atelier_api=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let db = atelier_db::Database::open(&config.db_path)?;
    let dispatcher = Dispatcher::new(config.feed_capacity);
    let state = Arc::new(AppStateInner { db, dispatcher });

    let app = atelier_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(feed_capacity = config.feed_capacity, "Atelier server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
