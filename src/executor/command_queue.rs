//! Agent-facing side of the command queue: enqueue, poll, and result reconciliation.
//!
//! State transitions themselves are enforced by the store; this layer adds the
//! NOOP placeholder, counter bookkeeping, events and operator notifications.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::domain::types::{
    AgentSession, Command, CommandResult, CommandStatus, CommandType, Event, EventType, NewCommand,
};
use crate::error::{BotError, Result};
use crate::events::bus::{payload, EventBus};
use crate::store::Store;
use crate::telegram::notifier::Notifier;

#[derive(Debug, Clone, Serialize)]
pub struct ResultOutcome {
    pub command: Command,
    pub event: Event,
    pub open_positions: i64,
}

pub struct CommandQueue {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    noop_ttl: chrono::Duration,
}

impl CommandQueue {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        risk: &RiskConfig,
    ) -> Self {
        Self {
            store,
            events,
            notifier,
            noop_ttl: chrono::Duration::seconds(risk.noop_ttl_secs as i64),
        }
    }

    pub async fn enqueue(&self, command: NewCommand) -> Result<Command> {
        let cmd = self.store.enqueue_command(command).await?;
        info!(
            command_id = %cmd.id,
            account_id = %cmd.account_id,
            command_type = %cmd.command_type,
            symbol = %cmd.symbol,
            side = %cmd.side,
            expires_at = %cmd.expires_at,
            "Command enqueued"
        );
        Ok(cmd)
    }

    pub async fn next_queued(&self, account_id: &str) -> Result<Command> {
        self.store.next_queued_command(account_id).await
    }

    /// Next command for the polling agent, or a short-lived NOOP when the queue is empty.
    pub async fn poll(&self, session: &AgentSession) -> Result<Command> {
        self.store.touch_device(&session.device_id).await?;
        match self.next_queued(&session.account_id).await {
            Ok(cmd) => {
                info!(
                    command_id = %cmd.id,
                    account_id = %session.account_id,
                    device_id = %session.device_id,
                    "Command handed to agent"
                );
                Ok(cmd)
            }
            Err(e) if e.is_not_found() => Ok(self.noop(&session.account_id)),
            Err(e) => Err(e),
        }
    }

    fn noop(&self, account_id: &str) -> Command {
        let now = Utc::now();
        let mut draft = NewCommand::new(account_id, CommandType::Noop, now + self.noop_ttl);
        draft.status = Some(CommandStatus::Dispatched);
        draft.into_command(now)
    }

    /// Apply the agent's outcome for a dispatched command.
    pub async fn report_result(
        &self,
        session: &AgentSession,
        result: &CommandResult,
    ) -> Result<ResultOutcome> {
        if result.command_id.trim().is_empty() {
            return Err(BotError::Validation("command_id is required".into()));
        }
        let existing = self.store.get_command(&result.command_id).await?;
        if existing.account_id != session.account_id {
            warn!(
                command_id = %result.command_id,
                account_id = %session.account_id,
                "Result reported for another account's command"
            );
            return Err(BotError::not_found(format!("command {}", result.command_id)));
        }

        let cmd = self.store.mark_command_result(result).await?;
        let success = result.is_success();

        let open_positions = match (success, cmd.command_type) {
            (true, CommandType::Open) => self.store.adjust_open_positions(&cmd.account_id, 1).await?,
            (true, CommandType::Close) => self.store.adjust_open_positions(&cmd.account_id, -1).await?,
            _ => self.store.open_positions(&cmd.account_id).await?,
        };

        let event_type = if cmd.command_type.is_modification() {
            EventType::TradeModified
        } else {
            EventType::TradeExecuted
        };
        let event = self
            .events
            .emit(
                event_type,
                Some(&cmd.account_id),
                payload(json!({
                    "command_id": result.command_id,
                    "status": result.status,
                    "broker_ticket": result.broker_ticket,
                    "error_code": result.error_code,
                    "error_message": result.error_message,
                    "command_type": cmd.command_type,
                    "symbol": cmd.symbol,
                })),
            )
            .await?;

        info!(
            command_id = %cmd.id,
            account_id = %cmd.account_id,
            status = %cmd.status,
            broker_ticket = %result.broker_ticket,
            open_positions,
            "Command result recorded"
        );

        if success {
            self.notifier
                .notify(&format!(
                    "[{}] {} {} {:.2}",
                    cmd.command_type, cmd.side, cmd.symbol, cmd.volume
                ))
                .await;
        } else {
            debug!(command_id = %cmd.id, error_code = ?result.error_code, "Agent reported failure");
        }

        Ok(ResultOutcome {
            command: cmd,
            event,
            open_positions,
        })
    }
}
