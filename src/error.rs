//! Unified error types for the dispatch gateway.

use thiserror::Error;

use crate::domain::types::CommandStatus;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("at least {required} candles required, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("candle {0} has a non-positive price")]
    InvalidCandle(usize),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("command {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    pub fn not_found(what: impl Into<String>) -> Self {
        BotError::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BotError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
