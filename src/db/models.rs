//! Database row types and their conversion into domain records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::domain::types::{
    AgentSession, Command, Event, OAuthState, ProviderConnection, AGENT_SCOPES,
};
use crate::error::{BotError, Result};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbCommand {
    pub id: String,
    pub account_id: String,
    pub device_id: Option<String>,
    pub command_type: String,
    pub symbol: String,
    pub side: String,
    pub volume: f64,
    pub sl: f64,
    pub tp: f64,
    pub reason: String,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbCommand> for Command {
    type Error = BotError;

    fn try_from(row: DbCommand) -> Result<Self> {
        Ok(Command {
            command_type: row.command_type.parse()?,
            status: row.status.parse()?,
            id: row.id,
            account_id: row.account_id,
            device_id: row.device_id,
            symbol: row.symbol,
            side: row.side,
            volume: row.volume,
            sl: row.sl,
            tp: row.tp,
            reason: row.reason,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbEvent {
    pub id: String,
    pub account_id: Option<String>,
    pub event_type: String,
    pub payload: Json<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbEvent> for Event {
    type Error = BotError;

    fn try_from(row: DbEvent) -> Result<Self> {
        Ok(Event {
            id: row.id,
            account_id: row.account_id,
            event_type: row.event_type.parse()?,
            payload: row.payload.0,
            created_at: row.created_at,
        })
    }
}

/// Device row looked up by token hash. The plaintext token is never stored.
#[derive(Debug, Clone, FromRow)]
pub struct DbDeviceSession {
    pub account_id: String,
    pub device_id: String,
    pub token_expires_at: DateTime<Utc>,
}

impl DbDeviceSession {
    pub fn into_session(self, token: &str) -> AgentSession {
        AgentSession {
            token: token.to_string(),
            account_id: self.account_id,
            device_id: self.device_id,
            expires_at: self.token_expires_at,
            scopes: AGENT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbOAuthState {
    pub state: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

impl From<DbOAuthState> for OAuthState {
    fn from(row: DbOAuthState) -> Self {
        OAuthState {
            state: row.state,
            provider: row.provider,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbProviderConnection {
    pub provider: String,
    pub access_token: String,
    pub refresh_token: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

impl From<DbProviderConnection> for ProviderConnection {
    fn from(row: DbProviderConnection) -> Self {
        ProviderConnection {
            provider: row.provider,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            scopes: row.scopes,
            expires_at: row.expires_at,
            connected_at: row.connected_at,
        }
    }
}
