//! Shared fixtures for unit tests: an in-memory store with every service wired to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, WebhookConfig};
use crate::domain::types::{AgentSession, ProviderConnection};
use crate::events::bus::EventBus;
use crate::events::publisher::EventPublisher;
use crate::executor::command_queue::CommandQueue;
use crate::oauth::token_manager::OAuthTokenManager;
use crate::position::circuit_breaker::CircuitBreaker;
use crate::store::{MemoryStore, Store};
use crate::telegram::notifier::Notifier;

/// Collects notifications in memory.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, text: &str) {
        self.messages.lock().push(text.to_string());
    }
}

pub(crate) struct Harness {
    pub config: Config,
    pub store: Arc<dyn Store>,
    /// Same store as `store`, for backend-specific inspection.
    pub memory: Arc<MemoryStore>,
    pub bus: Arc<EventBus>,
    pub notifier: Arc<RecordingNotifier>,
    pub queue: Arc<CommandQueue>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::for_tests())
    }

    pub fn with_config(config: Config) -> Self {
        let memory = Arc::new(MemoryStore::new(config.store.session_ttl()));
        let store: Arc<dyn Store> = memory.clone();
        let publisher = EventPublisher::new(&WebhookConfig::default()).unwrap();
        let bus = Arc::new(EventBus::new(
            store.clone(),
            Arc::new(publisher),
            Duration::from_secs(5),
            CancellationToken::new(),
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let queue = Arc::new(CommandQueue::new(
            store.clone(),
            bus.clone(),
            notifier.clone(),
            &config.risk,
        ));
        Self {
            config,
            store,
            memory,
            bus,
            notifier,
            queue,
        }
    }

    pub async fn session(&self, account_id: &str) -> AgentSession {
        self.store
            .issue_session(account_id, &format!("dev-{account_id}"))
            .await
            .unwrap()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifier.messages.lock().clone()
    }

    pub fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.store.clone(),
            self.bus.clone(),
            self.notifier.clone(),
            self.config.risk.max_daily_loss_pct,
        )
    }

    pub fn token_manager(&self) -> Arc<OAuthTokenManager> {
        Arc::new(OAuthTokenManager::new(&self.config.oauth, self.store.clone()).unwrap())
    }

    /// Store a provider grant that stays usable for an hour.
    pub async fn connect_provider(&self) {
        let now = Utc::now();
        self.store
            .save_provider_connection(ProviderConnection {
                provider: self.config.oauth.provider.clone(),
                access_token: "at-test".into(),
                refresh_token: "rt-test".into(),
                scopes: vec!["models.read".into()],
                expires_at: now + chrono::Duration::hours(1),
                connected_at: now,
            })
            .await
            .unwrap();
    }
}
