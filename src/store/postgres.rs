//! PostgreSQL store. Dispatch is a transactional claim with `FOR UPDATE SKIP LOCKED`
//! so concurrent pollers across processes never receive the same command.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};

use super::{effective_limit, Store, EXPIRED_REASON};
use crate::db::models::{DbCommand, DbDeviceSession, DbEvent, DbOAuthState, DbProviderConnection};
use crate::domain::types::{
    AgentSession, Command, CommandResult, CommandStatus, Event, EventType, NewCommand, OAuthState,
    ProviderConnection, AGENT_SCOPES,
};
use crate::error::{BotError, Result};

const PAUSED_KEY: &str = "global_paused";

pub struct PgStore {
    pool: PgPool,
    session_ttl: chrono::Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, session_ttl: chrono::Duration) -> Self {
        Self { pool, session_ttl }
    }
}

pub(crate) fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[async_trait]
impl Store for PgStore {
    async fn issue_session(&self, account_id: &str, device_id: &str) -> Result<AgentSession> {
        let now = Utc::now();
        let token = uuid::Uuid::new_v4().to_string();
        let expires_at = now + self.session_ttl;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO broker_accounts (id) VALUES ($1) ON CONFLICT (id) DO NOTHING",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO daily_risk_state (account_id) VALUES ($1) ON CONFLICT (account_id) DO NOTHING",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO ea_devices (id, account_id, token_hash, token_expires_at, last_seen_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
             SET account_id = EXCLUDED.account_id,
                 token_hash = EXCLUDED.token_hash,
                 token_expires_at = EXCLUDED.token_expires_at,
                 last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(device_id)
        .bind(account_id)
        .bind(hash_token(&token))
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(AgentSession {
            token,
            account_id: account_id.to_string(),
            device_id: device_id.to_string(),
            expires_at,
            scopes: AGENT_SCOPES.iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn validate_session(&self, token: &str) -> Result<AgentSession> {
        let row = sqlx::query_as::<_, DbDeviceSession>(
            "SELECT account_id, id AS device_id, token_expires_at
             FROM ea_devices WHERE token_hash = $1 LIMIT 1",
        )
        .bind(hash_token(token))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BotError::not_found("session"))?;

        if row.token_expires_at < Utc::now() {
            return Err(BotError::Unauthorized("session expired".into()));
        }
        Ok(row.into_session(token))
    }

    async fn touch_device(&self, device_id: &str) -> Result<()> {
        sqlx::query("UPDATE ea_devices SET last_seen_at = now() WHERE id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_position_snapshot(&self, account_id: &str, snapshot: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO position_snapshots (account_id, snapshot, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (account_id) DO UPDATE
             SET snapshot = EXCLUDED.snapshot, updated_at = now()",
        )
        .bind(account_id)
        .bind(Json(snapshot))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_command(&self, command: NewCommand) -> Result<Command> {
        let cmd = command.into_command(Utc::now());
        sqlx::query(
            "INSERT INTO commands
             (id, account_id, device_id, type, symbol, side, volume, sl, tp, reason, status, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&cmd.id)
        .bind(&cmd.account_id)
        .bind(&cmd.device_id)
        .bind(cmd.command_type.as_str())
        .bind(&cmd.symbol)
        .bind(&cmd.side)
        .bind(cmd.volume)
        .bind(cmd.sl)
        .bind(cmd.tp)
        .bind(&cmd.reason)
        .bind(cmd.status.as_str())
        .bind(cmd.expires_at)
        .bind(cmd.created_at)
        .execute(&self.pool)
        .await?;
        Ok(cmd)
    }

    async fn next_queued_command(&self, account_id: &str) -> Result<Command> {
        let mut tx = self.pool.begin().await?;

        let swept = sqlx::query(
            "UPDATE commands
             SET status = 'FAILED', reason = $2, updated_at = now()
             WHERE account_id = $1 AND status = 'QUEUED' AND expires_at < now()",
        )
        .bind(account_id)
        .bind(EXPIRED_REASON)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if swept > 0 {
            info!(account_id, swept, "Commands expired before dispatch");
        }

        let claimed = sqlx::query_as::<_, DbCommand>(
            "SELECT id, account_id, device_id, type AS command_type, symbol, side, volume, sl, tp,
                    reason, status, expires_at, created_at
             FROM commands
             WHERE account_id = $1 AND status = 'QUEUED' AND expires_at >= now()
             ORDER BY created_at ASC, seq ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = claimed else {
            tx.commit().await?;
            return Err(BotError::not_found("queued command"));
        };

        sqlx::query("UPDATE commands SET status = 'DISPATCHED', updated_at = now() WHERE id = $1")
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut cmd = Command::try_from(row)?;
        cmd.status = CommandStatus::Dispatched;
        debug!(command_id = %cmd.id, account_id, "Command dispatched");
        Ok(cmd)
    }

    async fn mark_command_result(&self, result: &CommandResult) -> Result<Command> {
        let next = result.target_status();
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM commands WHERE id = $1 FOR UPDATE")
                .bind(&result.command_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current: CommandStatus = current
            .ok_or_else(|| BotError::not_found(format!("command {}", result.command_id)))?
            .parse()?;
        if current != CommandStatus::Dispatched {
            return Err(BotError::InvalidTransition {
                id: result.command_id.clone(),
                from: current,
                to: next,
            });
        }

        let row = sqlx::query_as::<_, DbCommand>(
            "UPDATE commands SET status = $2, updated_at = now()
             WHERE id = $1
             RETURNING id, account_id, device_id, type AS command_type, symbol, side, volume, sl, tp,
                       reason, status, expires_at, created_at",
        )
        .bind(&result.command_id)
        .bind(next.as_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Command::try_from(row)
    }

    async fn get_command(&self, command_id: &str) -> Result<Command> {
        let row = sqlx::query_as::<_, DbCommand>(
            "SELECT id, account_id, device_id, type AS command_type, symbol, side, volume, sl, tp,
                    reason, status, expires_at, created_at
             FROM commands WHERE id = $1",
        )
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BotError::not_found(format!("command {command_id}")))?;
        Command::try_from(row)
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_state (key, value_json, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE
             SET value_json = EXCLUDED.value_json, updated_at = now()",
        )
        .bind(PAUSED_KEY)
        .bind(Json(json!({ "paused": paused })))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        let paused: Option<bool> = sqlx::query_scalar(
            "SELECT COALESCE((value_json->>'paused')::boolean, false) FROM app_state WHERE key = $1",
        )
        .bind(PAUSED_KEY)
        .fetch_optional(&self.pool)
        .await?;
        Ok(paused.unwrap_or(false))
    }

    async fn append_event(
        &self,
        event_type: EventType,
        account_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<Event> {
        let event = Event::new(event_type, account_id, payload);
        sqlx::query(
            "INSERT INTO events (id, account_id, event_type, payload, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&event.id)
        .bind(&event.account_id)
        .bind(event.event_type.as_str())
        .bind(Json(&event.payload))
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(event)
    }

    async fn list_events(&self, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, DbEvent>(
            "SELECT id, account_id, event_type, payload, created_at
             FROM events ORDER BY created_at DESC LIMIT $1",
        )
        .bind(effective_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Event::try_from).collect()
    }

    async fn open_positions(&self, account_id: &str) -> Result<i64> {
        let n: Option<i64> =
            sqlx::query_scalar("SELECT open_positions FROM daily_risk_state WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(n.unwrap_or(0))
    }

    async fn adjust_open_positions(&self, account_id: &str, delta: i64) -> Result<i64> {
        let n = sqlx::query_scalar::<_, i64>(
            "INSERT INTO daily_risk_state (account_id, open_positions, updated_at)
             VALUES ($1, GREATEST($2, 0), now())
             ON CONFLICT (account_id) DO UPDATE
             SET open_positions = GREATEST(daily_risk_state.open_positions + $2, 0),
                 updated_at = now()
             RETURNING open_positions",
        )
        .bind(account_id)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    async fn set_open_positions(&self, account_id: &str, count: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_risk_state (account_id, open_positions, updated_at)
             VALUES ($1, GREATEST($2, 0), now())
             ON CONFLICT (account_id) DO UPDATE
             SET open_positions = EXCLUDED.open_positions, updated_at = now()",
        )
        .bind(account_id)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_loss(&self, account_id: &str) -> Result<f64> {
        let v: Option<f64> =
            sqlx::query_scalar("SELECT daily_loss_pct FROM daily_risk_state WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(v.unwrap_or(0.0))
    }

    async fn set_daily_loss(&self, account_id: &str, loss_pct: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_risk_state (account_id, daily_loss_pct, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (account_id) DO UPDATE
             SET daily_loss_pct = EXCLUDED.daily_loss_pct, updated_at = now()",
        )
        .bind(account_id)
        .bind(loss_pct)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_oauth_state(&self, state: OAuthState) -> Result<()> {
        sqlx::query("INSERT INTO oauth_states (state, provider, created_at) VALUES ($1, $2, $3)")
            .bind(&state.state)
            .bind(&state.provider)
            .bind(state.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn consume_oauth_state(&self, state: &str) -> Result<OAuthState> {
        sqlx::query_as::<_, DbOAuthState>(
            "DELETE FROM oauth_states WHERE state = $1 RETURNING state, provider, created_at",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?
        .map(OAuthState::from)
        .ok_or_else(|| BotError::not_found("oauth state"))
    }

    async fn save_provider_connection(&self, connection: ProviderConnection) -> Result<()> {
        sqlx::query(
            "INSERT INTO oauth_provider_connections
             (provider, access_token, refresh_token, scopes, expires_at, connected_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (provider) DO UPDATE
             SET access_token = EXCLUDED.access_token,
                 refresh_token = EXCLUDED.refresh_token,
                 scopes = EXCLUDED.scopes,
                 expires_at = EXCLUDED.expires_at,
                 connected_at = EXCLUDED.connected_at",
        )
        .bind(&connection.provider)
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(&connection.scopes)
        .bind(connection.expires_at)
        .bind(connection.connected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_provider_connection(&self, provider: &str) -> Result<Option<ProviderConnection>> {
        let row = sqlx::query_as::<_, DbProviderConnection>(
            "SELECT provider, access_token, refresh_token, scopes, expires_at, connected_at
             FROM oauth_provider_connections WHERE provider = $1",
        )
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProviderConnection::from))
    }

    async fn clear_provider_connection(&self, provider: &str) -> Result<()> {
        sqlx::query("DELETE FROM oauth_provider_connections WHERE provider = $1")
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
