//! Configuration: TOML file defaults plus environment variable overrides.
//!
//! Tunables live in `config/default.toml`.
//! Secrets (tokens, client credentials, database URL) come from environment variables.

use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::BotError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:18080".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_mode")]
    pub mode: StoreMode,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

fn default_store_mode() -> StoreMode {
    StoreMode::Memory
}
fn default_session_ttl() -> u64 {
    24 * 60 * 60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: default_store_mode(),
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl StoreConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Bearer token accepted on admin routes.
    #[serde(default)]
    pub admin_api_token: String,
    /// One-time code an execution agent presents to register.
    #[serde(default)]
    pub ea_connect_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: i64,
    #[serde(default = "default_max_spread_pips")]
    pub max_spread_pips: f64,
    /// Lots per OPEN command. Position sizing is not derived from equity.
    #[serde(default = "default_fixed_volume")]
    pub fixed_volume: f64,
    #[serde(default = "default_command_ttl")]
    pub command_ttl_secs: u64,
    #[serde(default = "default_noop_ttl")]
    pub noop_ttl_secs: u64,
    #[serde(default = "default_account_id")]
    pub default_account_id: String,
}

fn default_min_confidence() -> f64 {
    0.70
}
fn default_max_daily_loss_pct() -> f64 {
    2.0
}
fn default_max_open_positions() -> i64 {
    3
}
fn default_max_spread_pips() -> f64 {
    2.0
}
fn default_fixed_volume() -> f64 {
    0.01
}
fn default_command_ttl() -> u64 {
    30
}
fn default_noop_ttl() -> u64 {
    2
}
fn default_account_id() -> String {
    "paper-1".into()
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_open_positions: default_max_open_positions(),
            max_spread_pips: default_max_spread_pips(),
            fixed_volume: default_fixed_volume(),
            command_ttl_secs: default_command_ttl(),
            noop_ttl_secs: default_noop_ttl(),
            default_account_id: default_account_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,
    #[serde(default = "default_slow_period")]
    pub slow_period: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,
}

fn default_fast_period() -> usize {
    20
}
fn default_slow_period() -> usize {
    50
}
fn default_atr_period() -> usize {
    14
}
fn default_max_candles() -> usize {
    300
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
            atr_period: default_atr_period(),
            max_candles: default_max_candles(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: u64,
    #[serde(default = "default_oauth_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_auth_url() -> String {
    "https://auth.openai.com/oauth/authorize".into()
}
fn default_token_url() -> String {
    "https://auth.openai.com/oauth/token".into()
}
fn default_scopes() -> String {
    "models.read models.inference".into()
}
fn default_redirect_uri() -> String {
    "http://localhost:18080/oauth/openai/callback".into()
}
fn default_refresh_skew() -> u64 {
    120
}
fn default_oauth_timeout() -> u64 {
    10
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            scopes: default_scopes(),
            redirect_uri: default_redirect_uri(),
            refresh_skew_secs: default_refresh_skew(),
            request_timeout_secs: default_oauth_timeout(),
        }
    }
}

impl OAuthConfig {
    pub fn refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_skew_secs as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Empty disables publication.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Upper bound on one event's whole delivery, retries included.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_delivery_timeout_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_max_ms() -> u64 {
    5_000
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_output: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_output: false,
        }
    }
}

impl Config {
    /// Load configuration from `config/default.toml` merged with env vars.
    /// Tunables come from env vars prefixed with `MMBOT_`; secrets from their plain names.
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("MMBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Config = builder.try_deserialize()?;

        // Override secrets from env (these should never be in TOML)
        if let Ok(v) = env::var("DATABASE_URL") {
            cfg.database.url = v;
        }
        if let Ok(v) = env::var("ADMIN_API_TOKEN") {
            cfg.auth.admin_api_token = v;
        }
        if let Ok(v) = env::var("EA_CONNECT_CODE") {
            cfg.auth.ea_connect_code = v;
        }
        if let Ok(v) = env::var("OAUTH_CLIENT_ID") {
            cfg.oauth.client_id = v;
        }
        if let Ok(v) = env::var("OAUTH_CLIENT_SECRET") {
            cfg.oauth.client_secret = v;
        }
        if let Ok(v) = env::var("WEBHOOK_URL") {
            cfg.webhook.url = v;
        }
        if let Ok(v) = env::var("TELEGRAM_BOT_TOKEN") {
            cfg.telegram.bot_token = Some(v);
        }
        if let Ok(v) = env::var("TELEGRAM_CHAT_ID") {
            cfg.telegram.chat_id = Some(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the service cannot start with and normalize the rest.
    pub fn validate(&mut self) -> Result<(), BotError> {
        if self.store.mode == StoreMode::Postgres && self.database.url.trim().is_empty() {
            return Err(BotError::Config(
                "store.mode = postgres requires DATABASE_URL".into(),
            ));
        }
        if self.auth.ea_connect_code.trim().is_empty() {
            return Err(BotError::Config("EA_CONNECT_CODE is required".into()));
        }
        if self.auth.admin_api_token.trim().is_empty() {
            return Err(BotError::Config("ADMIN_API_TOKEN is required".into()));
        }
        if self.strategy.fast_period == 0
            || self.strategy.slow_period == 0
            || self.strategy.atr_period == 0
        {
            return Err(BotError::Config("strategy periods must be at least 1".into()));
        }
        check_secs("risk.command_ttl_secs", self.risk.command_ttl_secs, 1, MAX_COMMAND_TTL_SECS)?;
        check_secs("risk.noop_ttl_secs", self.risk.noop_ttl_secs, 1, MAX_COMMAND_TTL_SECS)?;
        check_secs("store.session_ttl_secs", self.store.session_ttl_secs, 1, MAX_SESSION_TTL_SECS)?;
        check_secs("oauth.refresh_skew_secs", self.oauth.refresh_skew_secs, 0, MAX_COMMAND_TTL_SECS)?;
        if self.webhook.retry_max_ms < self.webhook.retry_base_ms {
            self.webhook.retry_max_ms = self.webhook.retry_base_ms;
        }
        Ok(())
    }
}

/// Upper bound for command, NOOP and refresh-skew windows.
pub const MAX_COMMAND_TTL_SECS: u64 = 86_400;
pub const MAX_SESSION_TTL_SECS: u64 = 365 * 86_400;

fn check_secs(name: &str, value: u64, min: u64, max: u64) -> Result<(), BotError> {
    if value < min || value > max {
        return Err(BotError::Config(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
impl Config {
    /// Defaults plus the two required secrets.
    pub fn for_tests() -> Self {
        Config {
            auth: AuthConfig {
                admin_api_token: "admin-token".into(),
                ea_connect_code: "MMBOT-ONE-TIME-CODE".into(),
            },
            ..Config::default()
        }
    }
}
