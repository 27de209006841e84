//! Axum HTTP server: service wiring and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::events::bus::EventBus;
use crate::events::publisher::EventPublisher;
use crate::executor::command_queue::CommandQueue;
use crate::oauth::token_manager::OAuthTokenManager;
use crate::position::circuit_breaker::CircuitBreaker;
use crate::store::Store;
use crate::strategy::engine::SignalEngine;
use crate::telegram::notifier::Notifier;

use super::routes;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub events: Arc<EventBus>,
    pub queue: Arc<CommandQueue>,
    pub breaker: Arc<CircuitBreaker>,
    pub signals: Arc<SignalEngine>,
    pub tokens: Arc<OAuthTokenManager>,
}

impl AppState {
    /// Wire every service onto one store. `shutdown` bounds background webhook deliveries.
    pub fn build(
        config: Config,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let publisher = Arc::new(EventPublisher::new(&config.webhook)?);
        let events = Arc::new(EventBus::new(
            store.clone(),
            publisher,
            Duration::from_millis(config.webhook.delivery_timeout_ms),
            shutdown,
        ));
        let tokens = Arc::new(OAuthTokenManager::new(&config.oauth, store.clone())?);
        let queue = Arc::new(CommandQueue::new(
            store.clone(),
            events.clone(),
            notifier.clone(),
            &config.risk,
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            store.clone(),
            events.clone(),
            notifier.clone(),
            config.risk.max_daily_loss_pct,
        ));
        let signals = Arc::new(SignalEngine::new(
            store.clone(),
            events.clone(),
            notifier,
            tokens.clone(),
            queue.clone(),
            &config.risk,
            &config.strategy,
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            events,
            queue,
            breaker,
            signals,
            tokens,
        })
    }
}

pub fn router(state: AppState) -> Router {
    routes::api_routes().with_state(state)
}

pub struct WebServer {
    state: AppState,
}

impl WebServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serve until `shutdown` fires, then drain in-flight requests.
    pub async fn start(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = self.state.config.server.listen_addr.clone();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %addr, "HTTP server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
