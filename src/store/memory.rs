//! In-process store. One `RwLock` guards everything; operations are short and never await
//! while holding it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{effective_limit, Store, EXPIRED_REASON};
use crate::domain::types::{
    AgentSession, Command, CommandResult, CommandStatus, Event, EventType, NewCommand, OAuthState,
    ProviderConnection, AGENT_SCOPES,
};
use crate::error::{BotError, Result};

#[derive(Default)]
struct Inner {
    paused: bool,
    sessions: HashMap<String, AgentSession>,
    commands: HashMap<String, Command>,
    /// Command ids in creation order; dispatch scans this for FIFO per account.
    command_order: Vec<String>,
    events: Vec<Event>,
    open_positions: HashMap<String, i64>,
    daily_loss: HashMap<String, f64>,
    last_seen: HashMap<String, DateTime<Utc>>,
    oauth_states: HashMap<String, OAuthState>,
    connections: HashMap<String, ProviderConnection>,
    snapshots: HashMap<String, Value>,
}

pub struct MemoryStore {
    session_ttl: chrono::Duration,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(session_ttl: chrono::Duration) -> Self {
        Self {
            session_ttl,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Latest raw snapshot reported for an account.
    pub fn latest_snapshot(&self, account_id: &str) -> Option<Value> {
        self.inner.read().snapshots.get(account_id).cloned()
    }

    pub fn last_seen(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.inner.read().last_seen.get(device_id).copied()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn issue_session(&self, account_id: &str, device_id: &str) -> Result<AgentSession> {
        let session = AgentSession {
            token: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            device_id: device_id.to_string(),
            expires_at: Utc::now() + self.session_ttl,
            scopes: AGENT_SCOPES.iter().map(|s| s.to_string()).collect(),
        };
        self.inner
            .write()
            .sessions
            .insert(session.token.clone(), session.clone());
        Ok(session)
    }

    async fn validate_session(&self, token: &str) -> Result<AgentSession> {
        let session = self
            .inner
            .read()
            .sessions
            .get(token)
            .cloned()
            .ok_or_else(|| BotError::not_found("session"))?;
        if session.expires_at < Utc::now() {
            return Err(BotError::Unauthorized("session expired".into()));
        }
        Ok(session)
    }

    async fn touch_device(&self, device_id: &str) -> Result<()> {
        self.inner
            .write()
            .last_seen
            .insert(device_id.to_string(), Utc::now());
        Ok(())
    }

    async fn save_position_snapshot(&self, account_id: &str, snapshot: &Value) -> Result<()> {
        self.inner
            .write()
            .snapshots
            .insert(account_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn enqueue_command(&self, command: NewCommand) -> Result<Command> {
        let command = command.into_command(Utc::now());
        let mut inner = self.inner.write();
        if inner.commands.contains_key(&command.id) {
            return Err(BotError::Validation(format!(
                "command {} already exists",
                command.id
            )));
        }
        inner.command_order.push(command.id.clone());
        inner.commands.insert(command.id.clone(), command.clone());
        Ok(command)
    }

    async fn next_queued_command(&self, account_id: &str) -> Result<Command> {
        let now = Utc::now();
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        for id in &inner.command_order {
            let Some(cmd) = inner.commands.get_mut(id) else {
                continue;
            };
            if cmd.account_id != account_id || cmd.status != CommandStatus::Queued {
                continue;
            }
            if cmd.is_expired(now) {
                cmd.status = CommandStatus::Failed;
                cmd.reason = EXPIRED_REASON.into();
                info!(command_id = %cmd.id, account_id, "Command expired before dispatch");
                continue;
            }
            cmd.status = CommandStatus::Dispatched;
            debug!(command_id = %cmd.id, account_id, "Command dispatched");
            return Ok(cmd.clone());
        }
        Err(BotError::not_found("queued command"))
    }

    async fn mark_command_result(&self, result: &CommandResult) -> Result<Command> {
        let mut inner = self.inner.write();
        let cmd = inner
            .commands
            .get_mut(&result.command_id)
            .ok_or_else(|| BotError::not_found(format!("command {}", result.command_id)))?;
        let next = result.target_status();
        if cmd.status != CommandStatus::Dispatched {
            return Err(BotError::InvalidTransition {
                id: cmd.id.clone(),
                from: cmd.status,
                to: next,
            });
        }
        cmd.status = next;
        Ok(cmd.clone())
    }

    async fn get_command(&self, command_id: &str) -> Result<Command> {
        self.inner
            .read()
            .commands
            .get(command_id)
            .cloned()
            .ok_or_else(|| BotError::not_found(format!("command {command_id}")))
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        self.inner.write().paused = paused;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.inner.read().paused)
    }

    async fn append_event(
        &self,
        event_type: EventType,
        account_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<Event> {
        let event = Event::new(event_type, account_id, payload);
        self.inner.write().events.push(event.clone());
        Ok(event)
    }

    async fn list_events(&self, limit: i64) -> Result<Vec<Event>> {
        let limit = effective_limit(limit) as usize;
        let inner = self.inner.read();
        Ok(inner.events.iter().rev().take(limit).cloned().collect())
    }

    async fn open_positions(&self, account_id: &str) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .open_positions
            .get(account_id)
            .copied()
            .unwrap_or(0))
    }

    async fn adjust_open_positions(&self, account_id: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.write();
        let count = inner.open_positions.entry(account_id.to_string()).or_insert(0);
        *count = (*count + delta).max(0);
        Ok(*count)
    }

    async fn set_open_positions(&self, account_id: &str, count: i64) -> Result<()> {
        self.inner
            .write()
            .open_positions
            .insert(account_id.to_string(), count.max(0));
        Ok(())
    }

    async fn daily_loss(&self, account_id: &str) -> Result<f64> {
        Ok(self
            .inner
            .read()
            .daily_loss
            .get(account_id)
            .copied()
            .unwrap_or(0.0))
    }

    async fn set_daily_loss(&self, account_id: &str, loss_pct: f64) -> Result<()> {
        self.inner
            .write()
            .daily_loss
            .insert(account_id.to_string(), loss_pct);
        Ok(())
    }

    async fn save_oauth_state(&self, state: OAuthState) -> Result<()> {
        self.inner
            .write()
            .oauth_states
            .insert(state.state.clone(), state);
        Ok(())
    }

    async fn consume_oauth_state(&self, state: &str) -> Result<OAuthState> {
        self.inner
            .write()
            .oauth_states
            .remove(state)
            .ok_or_else(|| BotError::not_found("oauth state"))
    }

    async fn save_provider_connection(&self, connection: ProviderConnection) -> Result<()> {
        self.inner
            .write()
            .connections
            .insert(connection.provider.clone(), connection);
        Ok(())
    }

    async fn get_provider_connection(&self, provider: &str) -> Result<Option<ProviderConnection>> {
        Ok(self.inner.read().connections.get(provider).cloned())
    }

    async fn clear_provider_connection(&self, provider: &str) -> Result<()> {
        self.inner.write().connections.remove(provider);
        Ok(())
    }
}
