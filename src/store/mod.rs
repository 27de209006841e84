//! Persistence port. Every piece of shared mutable state lives behind this trait.
//!
//! Two backends: [`memory::MemoryStore`] (one reader/writer lock over plain maps)
//! and [`postgres::PgStore`] (row locks inside transactions). Callers never see
//! which one they talk to.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::types::{
    AccountRiskState, AgentSession, Command, CommandResult, Event, EventType, NewCommand,
    OAuthState, ProviderConnection,
};
use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Reason recorded on commands swept by the dispatch scan.
pub const EXPIRED_REASON: &str = "expired before dispatch";
/// Page size used when a caller asks for a non-positive number of events.
pub const DEFAULT_EVENT_LIMIT: i64 = 20;

#[async_trait]
pub trait Store: Send + Sync {
    // Agent sessions
    async fn issue_session(&self, account_id: &str, device_id: &str) -> Result<AgentSession>;
    /// `NotFound` for unknown tokens, `Unauthorized` once expired.
    async fn validate_session(&self, token: &str) -> Result<AgentSession>;
    async fn touch_device(&self, device_id: &str) -> Result<()>;
    async fn save_position_snapshot(&self, account_id: &str, snapshot: &Value) -> Result<()>;

    // Command queue
    async fn enqueue_command(&self, command: NewCommand) -> Result<Command>;
    /// Sweep expired QUEUED commands to FAILED and claim the oldest valid one as DISPATCHED.
    /// A claimed command is never returned again.
    async fn next_queued_command(&self, account_id: &str) -> Result<Command>;
    /// One-shot DISPATCHED -> SUCCESS/FAILED.
    async fn mark_command_result(&self, result: &CommandResult) -> Result<Command>;
    async fn get_command(&self, command_id: &str) -> Result<Command>;

    // Global pause flag
    async fn set_paused(&self, paused: bool) -> Result<()>;
    async fn is_paused(&self) -> Result<bool>;

    // Event log
    async fn append_event(
        &self,
        event_type: EventType,
        account_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<Event>;
    /// Newest first.
    async fn list_events(&self, limit: i64) -> Result<Vec<Event>>;

    // Per-account risk counters
    async fn open_positions(&self, account_id: &str) -> Result<i64>;
    /// Returns the new count, floored at zero.
    async fn adjust_open_positions(&self, account_id: &str, delta: i64) -> Result<i64>;
    async fn set_open_positions(&self, account_id: &str, count: i64) -> Result<()>;
    async fn daily_loss(&self, account_id: &str) -> Result<f64>;
    async fn set_daily_loss(&self, account_id: &str, loss_pct: f64) -> Result<()>;

    async fn risk_state(&self, account_id: &str) -> Result<AccountRiskState> {
        Ok(AccountRiskState {
            paused: self.is_paused().await?,
            open_positions: self.open_positions(account_id).await?,
            daily_loss_pct: self.daily_loss(account_id).await?,
        })
    }

    // OAuth handshake and provider grant
    async fn save_oauth_state(&self, state: OAuthState) -> Result<()>;
    /// Single use: a second consume of the same state is `NotFound`.
    async fn consume_oauth_state(&self, state: &str) -> Result<OAuthState>;
    async fn save_provider_connection(&self, connection: ProviderConnection) -> Result<()>;
    async fn get_provider_connection(&self, provider: &str) -> Result<Option<ProviderConnection>>;
    async fn clear_provider_connection(&self, provider: &str) -> Result<()>;
}

pub(crate) fn effective_limit(limit: i64) -> i64 {
    if limit <= 0 {
        DEFAULT_EVENT_LIMIT
    } else {
        limit
    }
}
