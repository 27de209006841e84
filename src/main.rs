//! MMBot dispatch gateway entry point.
//!
//! Loads configuration, wires the store and services, and serves HTTP until
//! SIGINT/SIGTERM.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mmbot::config::{Config, StoreMode};
use mmbot::db::pool;
use mmbot::logging::structured::init_logging;
use mmbot::store::{MemoryStore, PgStore, Store};
use mmbot::telegram::notifier::{Notifier, TelegramNotifier};
use mmbot::web::server::{AppState, WebServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if missing)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        store = ?config.store.mode,
        listen_addr = %config.server.listen_addr,
        "mmbot starting"
    );

    let session_ttl = config.store.session_ttl();
    let store: Arc<dyn Store> = match config.store.mode {
        StoreMode::Memory => {
            warn!("using in-memory store, state is lost on restart");
            Arc::new(MemoryStore::new(session_ttl))
        }
        StoreMode::Postgres => {
            let db = pool::connect(&config.database).await?;
            info!("database connected and migrations applied");
            Arc::new(PgStore::new(db, session_ttl))
        }
    };

    let telegram = TelegramNotifier::new(&config.telegram);
    if !telegram.is_configured() {
        info!("telegram not configured, operator notifications disabled");
    }
    let notifier: Arc<dyn Notifier> = Arc::new(telegram);

    let shutdown = CancellationToken::new();
    let state = AppState::build(config, store, notifier, shutdown.clone())?;

    let server = WebServer::new(state);
    let server_token = shutdown.clone();
    let server_handle = tokio::spawn(async move { server.start(server_token).await });

    wait_for_signal().await;
    info!("shutdown requested");
    shutdown.cancel();

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task panicked"),
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
