use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use decety::catalog::flush_loop;
use decety::config::Config;
use decety::images::CommandDeriver;
use decety::server::routes::build_router;
use decety::server::AppState;
use decety::storage::DecetyStore;

#[tokio::main]
async fn main() {
    // Load .env
    let _ = dotenvy::dotenv();

    // Load config first (needed for logging setup)
    let config = Config::load(None).expect("failed to load config");

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
        }
    }

    tracing::info!("decety starting");
    decety::metrics::init();

    let store = DecetyStore::from_config(&config.storage).expect("failed to initialize storage");
    let deriver = Arc::new(CommandDeriver::from_config(&config.images));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let flush_every = Duration::from_secs(config.catalog.counter_flush_secs);
    let state = AppState::build(config, store, deriver)
        .await
        .expect("failed to open catalog");

    // Spawn background counter flush loop
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let flusher = tokio::spawn(flush_loop(state.catalog.clone(), flush_every, shutdown_rx));

    let app = build_router(state);

    tracing::info!(addr = %addr, "listening");
    let listener = TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("server error");

    // Signal shutdown to background tasks, then wait for the last flush
    let _ = shutdown_tx.send(true);
    let _ = flusher.await;
}
