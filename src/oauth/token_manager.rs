//! Keeps the provider connection fresh and answers "is the provider usable right now".
//!
//! Anything short of a verified fresh token reads as not connected, so callers
//! on the risk path deny instead of trading on a stale grant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::OAuthConfig;
use crate::domain::types::{OAuthState, ProviderConnection};
use crate::error::{BotError, Result};
use crate::oauth::client::{parse_scopes, OAuthClient};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationStart {
    pub provider: String,
    pub state: String,
    pub auth_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

pub struct OAuthTokenManager {
    provider: String,
    client: OAuthClient,
    store: Arc<dyn Store>,
    refresh_skew: chrono::Duration,
    configured_scopes: String,
    /// One refresh in flight per provider.
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OAuthTokenManager {
    pub fn new(config: &OAuthConfig, store: Arc<dyn Store>) -> Result<Self> {
        Ok(Self {
            provider: config.provider.clone(),
            client: OAuthClient::new(config)?,
            store,
            refresh_skew: config.refresh_skew(),
            configured_scopes: config.scopes.clone(),
            refresh_locks: DashMap::new(),
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Usable only while `now + skew` is still before expiry.
    pub fn is_usable(&self, conn: &ProviderConnection, now: DateTime<Utc>) -> bool {
        now + self.refresh_skew < conn.expires_at
    }

    /// A connection that is usable now, refreshing it first when needed.
    /// `None` means the provider must be treated as unavailable.
    pub async fn ensure_fresh(&self) -> Result<Option<ProviderConnection>> {
        let Some(conn) = self.store.get_provider_connection(&self.provider).await? else {
            return Ok(None);
        };
        if self.is_usable(&conn, Utc::now()) {
            return Ok(Some(conn));
        }

        let lock = self
            .refresh_locks
            .entry(self.provider.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited.
        let Some(conn) = self.store.get_provider_connection(&self.provider).await? else {
            return Ok(None);
        };
        if self.is_usable(&conn, Utc::now()) {
            return Ok(Some(conn));
        }
        if conn.refresh_token.trim().is_empty() {
            warn!(provider = %self.provider, "Provider token stale and no refresh token held");
            return Ok(None);
        }

        let refreshed_at = Utc::now();
        let (token, expires_at) = match self
            .client
            .refresh(&conn.refresh_token)
            .await
            .and_then(|t| t.expires_at(refreshed_at).map(|at| (t, at)))
        {
            Ok(pair) => pair,
            Err(e) => {
                warn!(provider = %self.provider, error = %e, "Provider token refresh failed");
                return Ok(None);
            }
        };

        let refresh_token = if token.refresh_token.trim().is_empty() {
            conn.refresh_token.clone()
        } else {
            token.refresh_token.clone()
        };
        let scopes = if token.scope.trim().is_empty() {
            conn.scopes.clone()
        } else {
            parse_scopes(&token.scope)
        };
        let refreshed = ProviderConnection {
            provider: self.provider.clone(),
            access_token: token.access_token.clone(),
            refresh_token,
            scopes,
            expires_at,
            connected_at: conn.connected_at,
        };
        self.store.save_provider_connection(refreshed.clone()).await?;
        info!(provider = %self.provider, expires_at = %refreshed.expires_at, "Provider token refreshed");

        Ok(Some(refreshed))
    }

    pub async fn start_authorization(&self) -> Result<AuthorizationStart> {
        if !self.client.has_credentials() {
            return Err(BotError::Config(format!(
                "oauth for {} is not configured",
                self.provider
            )));
        }
        let state = uuid::Uuid::new_v4().to_string();
        let auth_url = self.client.build_auth_url(&state)?;
        self.store
            .save_oauth_state(OAuthState {
                state: state.clone(),
                provider: self.provider.clone(),
                created_at: Utc::now(),
            })
            .await?;
        Ok(AuthorizationStart {
            provider: self.provider.clone(),
            state,
            auth_url,
        })
    }

    pub async fn complete_authorization(&self, state: &str, code: &str) -> Result<ProviderConnection> {
        if state.trim().is_empty() || code.trim().is_empty() {
            return Err(BotError::Validation("state and code are required".into()));
        }
        let saved = self.store.consume_oauth_state(state).await?;
        if saved.provider != self.provider {
            return Err(BotError::not_found("oauth state"));
        }

        let token = self.client.exchange_code(code).await?;
        let scope_source = if token.scope.trim().is_empty() {
            self.configured_scopes.as_str()
        } else {
            token.scope.as_str()
        };
        let now = Utc::now();
        let expires_at = token.expires_at(now)?;
        let conn = ProviderConnection {
            provider: self.provider.clone(),
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            scopes: parse_scopes(scope_source),
            expires_at,
            connected_at: now,
        };
        self.store.save_provider_connection(conn.clone()).await?;
        info!(provider = %self.provider, "Provider connected");
        Ok(conn)
    }

    pub async fn status(&self) -> Result<ConnectionStatus> {
        Ok(match self.ensure_fresh().await? {
            Some(conn) => ConnectionStatus {
                connected: true,
                provider: conn.provider,
                expires_at: Some(conn.expires_at),
                connected_at: Some(conn.connected_at),
                scopes: Some(conn.scopes),
            },
            None => ConnectionStatus {
                connected: false,
                provider: self.provider.clone(),
                expires_at: None,
                connected_at: None,
                scopes: None,
            },
        })
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.store.clear_provider_connection(&self.provider).await?;
        info!(provider = %self.provider, "Provider disconnected");
        Ok(())
    }
}
