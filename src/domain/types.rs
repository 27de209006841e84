//! Core domain records shared by the store, the risk path and the agent protocol.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BotError;

/// Scopes granted to every execution-agent session.
pub const AGENT_SCOPES: [&str; 3] = ["trade:execute", "trade:read", "account:read"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Open,
    Close,
    MoveSl,
    SetTp,
    Pause,
    Resume,
    Noop,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Open => "OPEN",
            CommandType::Close => "CLOSE",
            CommandType::MoveSl => "MOVE_SL",
            CommandType::SetTp => "SET_TP",
            CommandType::Pause => "PAUSE",
            CommandType::Resume => "RESUME",
            CommandType::Noop => "NOOP",
        }
    }

    /// Stop/target edits are reported as modifications rather than executions.
    pub fn is_modification(&self) -> bool {
        matches!(self, CommandType::MoveSl | CommandType::SetTp)
    }
}

impl FromStr for CommandType {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(CommandType::Open),
            "CLOSE" => Ok(CommandType::Close),
            "MOVE_SL" => Ok(CommandType::MoveSl),
            "SET_TP" => Ok(CommandType::SetTp),
            "PAUSE" => Ok(CommandType::Pause),
            "RESUME" => Ok(CommandType::Resume),
            "NOOP" => Ok(CommandType::Noop),
            other => Err(BotError::Validation(format!("unknown command type {other}"))),
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command lifecycle: QUEUED -> DISPATCHED -> {SUCCESS, FAILED}, or QUEUED -> FAILED on expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Queued,
    Dispatched,
    Success,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "QUEUED",
            CommandStatus::Dispatched => "DISPATCHED",
            CommandStatus::Success => "SUCCESS",
            CommandStatus::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        matches!(
            (self, next),
            (CommandStatus::Queued, CommandStatus::Dispatched)
                | (CommandStatus::Queued, CommandStatus::Failed)
                | (CommandStatus::Dispatched, CommandStatus::Success)
                | (CommandStatus::Dispatched, CommandStatus::Failed)
        )
    }
}

impl FromStr for CommandStatus {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(CommandStatus::Queued),
            "DISPATCHED" => Ok(CommandStatus::Dispatched),
            "SUCCESS" => Ok(CommandStatus::Success),
            "FAILED" => Ok(CommandStatus::Failed),
            other => Err(BotError::Validation(format!("unknown command status {other}"))),
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action queued for the remote execution agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "command_id")]
    pub id: String,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub sl: f64,
    #[serde(default)]
    pub tp: f64,
    #[serde(default)]
    pub reason: String,
    pub status: CommandStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A command as proposed by a caller. Missing id, status and creation time are filled on enqueue.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub id: Option<String>,
    pub account_id: String,
    pub device_id: Option<String>,
    pub command_type: CommandType,
    pub symbol: String,
    pub side: String,
    pub volume: f64,
    pub sl: f64,
    pub tp: f64,
    pub reason: String,
    pub status: Option<CommandStatus>,
    pub expires_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewCommand {
    pub fn new(account_id: impl Into<String>, command_type: CommandType, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            account_id: account_id.into(),
            device_id: None,
            command_type,
            symbol: String::new(),
            side: String::new(),
            volume: 0.0,
            sl: 0.0,
            tp: 0.0,
            reason: String::new(),
            status: None,
            expires_at,
            created_at: None,
        }
    }

    pub fn into_command(self, now: DateTime<Utc>) -> Command {
        Command {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            account_id: self.account_id,
            device_id: self.device_id,
            command_type: self.command_type,
            symbol: self.symbol,
            side: self.side,
            volume: self.volume,
            sl: self.sl,
            tp: self.tp,
            reason: self.reason,
            status: self.status.unwrap_or(CommandStatus::Queued),
            expires_at: self.expires_at,
            created_at: self.created_at.unwrap_or(now),
        }
    }
}

/// Outcome reported by the agent for one dispatched command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub status: String,
    #[serde(default)]
    pub broker_ticket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<String>,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("SUCCESS")
    }

    pub fn target_status(&self) -> CommandStatus {
        if self.is_success() {
            CommandStatus::Success
        } else {
            CommandStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    SignalProposed,
    TradeExecuted,
    TradeModified,
    RiskTriggered,
    BotPaused,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SignalProposed => "SignalProposed",
            EventType::TradeExecuted => "TradeExecuted",
            EventType::TradeModified => "TradeModified",
            EventType::RiskTriggered => "RiskTriggered",
            EventType::BotPaused => "BotPaused",
        }
    }
}

impl FromStr for EventType {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SignalProposed" => Ok(EventType::SignalProposed),
            "TradeExecuted" => Ok(EventType::TradeExecuted),
            "TradeModified" => Ok(EventType::TradeModified),
            "RiskTriggered" => Ok(EventType::RiskTriggered),
            "BotPaused" => Ok(EventType::BotPaused),
            other => Err(BotError::Validation(format!("unknown event type {other}"))),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record of a state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub event_type: EventType,
    pub payload: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, account_id: Option<&str>, payload: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.filter(|a| !a.is_empty()).map(str::to_string),
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Authenticated execution-agent session bound to one account and device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub token: String,
    pub account_id: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

/// One-time state token for the OAuth authorization handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthState {
    pub state: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

/// One OAuth grant for one provider. Tokens never leave the process in serialized form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderConnection {
    pub provider: String,
    #[serde(skip)]
    pub access_token: String,
    #[serde(skip)]
    pub refresh_token: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

/// Normalized trade proposal fed to the risk engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalInput {
    pub account_id: String,
    pub symbol: String,
    pub side: String,
    pub confidence: f64,
    pub reason: String,
    pub spread_pips: f64,
    pub stop_loss_pips: f64,
    pub take_profit_pips: f64,
}

/// Risk counters read fresh from the store for every decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AccountRiskState {
    pub paused: bool,
    pub open_positions: i64,
    pub daily_loss_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    BotPaused,
    SymbolMissing,
    SideMissing,
    StopLossRequired,
    SpreadTooHigh,
    AiConfidenceTooLow,
    MaxOpenPositionsReached,
    DailyLossLimitHit,
    ProviderUnavailableFailClosed,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::BotPaused => "bot_paused",
            DenyReason::SymbolMissing => "symbol_missing",
            DenyReason::SideMissing => "side_missing",
            DenyReason::StopLossRequired => "stop_loss_required",
            DenyReason::SpreadTooHigh => "spread_too_high",
            DenyReason::AiConfidenceTooLow => "ai_confidence_too_low",
            DenyReason::MaxOpenPositionsReached => "max_open_positions_reached",
            DenyReason::DailyLossLimitHit => "daily_loss_limit_hit",
            DenyReason::ProviderUnavailableFailClosed => "provider_unavailable_fail_closed",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<DenyReason>,
}

impl RiskDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            deny_reason: None,
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            deny_reason: Some(reason),
        }
    }
}
