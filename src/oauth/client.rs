//! OAuth2 authorization-code client for the signal-confidence provider.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::Deserialize;

use crate::config::OAuthConfig;
use crate::error::{BotError, Result};

/// Applied when the provider omits `expires_in` or sends a non-positive value.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub scope: String,
}

impl TokenResponse {
    /// Absolute expiry for a token issued at `now`. Lifetimes that do not fit a
    /// timestamp are an upstream fault, not a panic.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        chrono::Duration::try_seconds(self.expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                BotError::Upstream(format!("token expires_in {} out of range", self.expires_in))
            })
    }
}

enum Grant<'a> {
    AuthorizationCode(&'a str),
    RefreshToken(&'a str),
}

pub struct OAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    auth_url: String,
    token_url: String,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl OAuthClient {
    pub fn new(config: &OAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout().max(Duration::from_secs(1)))
            .build()?;
        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_url: config.auth_url.clone(),
            token_url: config.token_url.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scopes: parse_scopes(&config.scopes),
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub fn build_auth_url(&self, state: &str) -> Result<String> {
        if self.client_id.is_empty() || self.auth_url.is_empty() || self.redirect_uri.is_empty() {
            return Err(BotError::Config("oauth client is not configured".into()));
        }
        let scope = self.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| BotError::Config(format!("invalid oauth auth_url: {e}")))?;
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        self.request_token(Grant::AuthorizationCode(code)).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.request_token(Grant::RefreshToken(refresh_token)).await
    }

    async fn request_token(&self, grant: Grant<'_>) -> Result<TokenResponse> {
        if self.token_url.is_empty() {
            return Err(BotError::Config("oauth token_url is not configured".into()));
        }
        let mut form: Vec<(&str, &str)> = match grant {
            Grant::AuthorizationCode(code) => vec![
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ],
            Grant::RefreshToken(token) => {
                vec![("grant_type", "refresh_token"), ("refresh_token", token)]
            }
        };
        form.push(("client_id", self.client_id.as_str()));
        form.push(("client_secret", self.client_secret.as_str()));

        let resp = self
            .http
            .post(&self.token_url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BotError::Upstream(format!(
                "token request failed with status {}",
                resp.status().as_u16()
            )));
        }

        let mut token: TokenResponse = resp.json().await?;
        if token.access_token.is_empty() {
            return Err(BotError::Upstream("token response missing access_token".into()));
        }
        if token.expires_in <= 0 {
            token.expires_in = DEFAULT_EXPIRES_IN_SECS;
        }
        Ok(token)
    }
}

/// Split a space- or comma-separated scope list.
pub fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
