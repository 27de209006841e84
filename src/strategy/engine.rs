//! Signal engine: the path from a trade idea to a queued OPEN command.
//!
//! Every proposal passes the provider gate first, then the risk rules against
//! counters read fresh from the store. Denials are recorded as events and never
//! reach the queue.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{RiskConfig, StrategyConfig};
use crate::domain::types::{Command, CommandType, DenyReason, EventType, NewCommand, SignalInput};
use crate::error::{BotError, Result};
use crate::events::bus::{payload, EventBus};
use crate::executor::command_queue::CommandQueue;
use crate::oauth::token_manager::OAuthTokenManager;
use crate::store::Store;
use crate::strategy::risk::RiskEngine;
use crate::strategy::trend::{Candle, TrendInput, TrendSignal, TrendSignalEngine};
use crate::telegram::notifier::Notifier;

/// Result of one risk-gated proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalOutcome {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<DenyReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
}

impl SignalOutcome {
    fn denied(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            deny_reason: Some(reason),
            command: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrendRequest {
    pub account_id: String,
    pub symbol: String,
    pub spread_pips: f64,
    pub candles: Vec<Candle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendOutcome {
    pub has_signal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_signal: Option<TrendSignal>,
    #[serde(flatten)]
    pub decision: Option<SignalOutcome>,
}

pub struct SignalEngine {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    tokens: Arc<OAuthTokenManager>,
    queue: Arc<CommandQueue>,
    risk: RiskEngine,
    trend: TrendSignalEngine,
    max_candles: usize,
}

impl SignalEngine {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        tokens: Arc<OAuthTokenManager>,
        queue: Arc<CommandQueue>,
        risk: &RiskConfig,
        strategy: &StrategyConfig,
    ) -> Self {
        Self {
            store,
            events,
            notifier,
            tokens,
            queue,
            risk: RiskEngine::new(risk.clone()),
            trend: TrendSignalEngine::new(strategy),
            max_candles: strategy.max_candles,
        }
    }

    fn account_or_default(&self, account_id: &str) -> String {
        let trimmed = account_id.trim();
        if trimmed.is_empty() {
            self.risk.config().default_account_id.clone()
        } else {
            trimmed.to_string()
        }
    }

    /// Gate a proposal and queue an OPEN command when every check passes.
    pub async fn evaluate_and_queue(&self, mut input: SignalInput) -> Result<SignalOutcome> {
        input.account_id = self.account_or_default(&input.account_id);
        let account_id = input.account_id.clone();

        if !self.provider_available().await {
            warn!(
                account_id = %account_id,
                symbol = %input.symbol,
                "Provider unavailable, denying signal"
            );
            let reason = DenyReason::ProviderUnavailableFailClosed;
            self.events
                .emit(
                    EventType::RiskTriggered,
                    Some(&account_id),
                    payload(json!({"reason": reason, "input": input})),
                )
                .await?;
            return Ok(SignalOutcome::denied(reason));
        }

        let state = self.store.risk_state(&account_id).await?;
        let decision = self.risk.evaluate(&input, &state);

        self.events
            .emit(
                EventType::SignalProposed,
                Some(&account_id),
                payload(json!({
                    "symbol": input.symbol,
                    "side": input.side,
                    "confidence": input.confidence,
                    "allowed": decision.allowed,
                    "reason": input.reason,
                    "source": "strategy",
                })),
            )
            .await?;

        if let Some(reason) = decision.deny_reason {
            info!(
                account_id = %account_id,
                symbol = %input.symbol,
                side = %input.side,
                deny_reason = %reason,
                "Signal denied by risk rules"
            );
            self.events
                .emit(
                    EventType::RiskTriggered,
                    Some(&account_id),
                    payload(json!({
                        "reason": reason,
                        "symbol": input.symbol,
                        "side": input.side,
                    })),
                )
                .await?;
            self.notifier
                .notify(&format!(
                    "Risk trigger: {} ({} {})",
                    reason, input.side, input.symbol
                ))
                .await;
            return Ok(SignalOutcome::denied(reason));
        }

        let limits = self.risk.config();
        let mut draft = NewCommand::new(
            account_id,
            CommandType::Open,
            Utc::now() + chrono::Duration::seconds(limits.command_ttl_secs as i64),
        );
        draft.symbol = input.symbol.trim().to_string();
        draft.side = input.side.trim().to_ascii_uppercase();
        draft.volume = limits.fixed_volume;
        draft.sl = input.stop_loss_pips;
        draft.tp = input.take_profit_pips;
        draft.reason = input.reason;

        let command = self.queue.enqueue(draft).await?;
        Ok(SignalOutcome {
            allowed: true,
            deny_reason: None,
            command: Some(command),
        })
    }

    /// Run the trend detector and, on a setup, feed it through [`evaluate_and_queue`](Self::evaluate_and_queue).
    pub async fn evaluate_trend(&self, request: TrendRequest) -> Result<TrendOutcome> {
        if request.candles.len() > self.max_candles {
            return Err(BotError::Validation(format!(
                "at most {} candles accepted, got {}",
                self.max_candles,
                request.candles.len()
            )));
        }

        let signal = self.trend.evaluate(&TrendInput {
            symbol: &request.symbol,
            candles: &request.candles,
            spread_pips: request.spread_pips,
        })?;
        let Some(side) = signal.side.filter(|_| signal.has_signal) else {
            return Ok(TrendOutcome {
                has_signal: false,
                reason: Some(signal.reason),
                strategy_signal: None,
                decision: None,
            });
        };

        let decision = self
            .evaluate_and_queue(SignalInput {
                account_id: request.account_id,
                symbol: request.symbol,
                side: side.as_str().to_string(),
                confidence: signal.confidence,
                reason: signal.reason.clone(),
                spread_pips: request.spread_pips,
                stop_loss_pips: signal.stop_loss_pips,
                take_profit_pips: signal.take_profit_pips,
            })
            .await?;

        Ok(TrendOutcome {
            has_signal: true,
            reason: None,
            strategy_signal: Some(signal),
            decision: Some(decision),
        })
    }

    /// Fail closed: lookup errors read the same as a missing grant.
    async fn provider_available(&self) -> bool {
        match self.tokens.ensure_fresh().await {
            Ok(Some(conn)) => conn.expires_at > Utc::now(),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Provider connection check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::CommandStatus;
    use crate::strategy::trend::tests::{flat_candles, uptrend_candles};
    use crate::test_support::Harness;

    fn engine(h: &Harness) -> SignalEngine {
        SignalEngine::new(
            h.store.clone(),
            h.bus.clone(),
            h.notifier.clone(),
            h.token_manager(),
            h.queue.clone(),
            &h.config.risk,
            &h.config.strategy,
        )
    }

    fn proposal() -> SignalInput {
        SignalInput {
            account_id: String::new(),
            symbol: "EURUSD".into(),
            side: "buy".into(),
            confidence: 0.8,
            reason: "breakout".into(),
            spread_pips: 1.0,
            stop_loss_pips: 12.0,
            take_profit_pips: 24.0,
        }
    }

    #[tokio::test]
    async fn denies_without_provider_connection() {
        let h = Harness::new();
        let out = engine(&h).evaluate_and_queue(proposal()).await.unwrap();
        assert_eq!(out, SignalOutcome::denied(DenyReason::ProviderUnavailableFailClosed));

        let events = h.store.list_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::RiskTriggered);
        assert_eq!(events[0].payload["reason"], "provider_unavailable_fail_closed");
        assert_eq!(events[0].payload["input"]["account_id"], "paper-1");
        assert!(h.store.next_queued_command("paper-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn allowed_signal_queues_open_command() {
        let h = Harness::new();
        h.connect_provider().await;

        let out = engine(&h).evaluate_and_queue(proposal()).await.unwrap();
        assert!(out.allowed);
        let cmd = out.command.unwrap();
        assert_eq!(cmd.account_id, "paper-1");
        assert_eq!(cmd.command_type, CommandType::Open);
        assert_eq!(cmd.side, "BUY");
        assert_eq!(cmd.volume, 0.01);
        assert_eq!(cmd.sl, 12.0);
        assert_eq!(cmd.tp, 24.0);
        assert_eq!(cmd.status, CommandStatus::Queued);
        assert!(cmd.expires_at <= Utc::now() + chrono::Duration::seconds(30));

        let events = h.store.list_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::SignalProposed);
        assert_eq!(events[0].payload["allowed"], true);
        assert_eq!(events[0].payload["source"], "strategy");
        assert!(h.notifications().is_empty());
    }

    #[tokio::test]
    async fn risk_denial_records_and_notifies() {
        let h = Harness::new();
        h.connect_provider().await;
        h.store.set_paused(true).await.unwrap();

        let out = engine(&h).evaluate_and_queue(proposal()).await.unwrap();
        assert_eq!(out.deny_reason, Some(DenyReason::BotPaused));
        assert!(out.command.is_none());

        let events = h.store.list_events(10).await.unwrap();
        assert_eq!(events[0].event_type, EventType::RiskTriggered);
        assert_eq!(events[0].payload["reason"], "bot_paused");
        assert_eq!(events[1].event_type, EventType::SignalProposed);
        assert_eq!(events[1].payload["allowed"], false);
        assert_eq!(h.notifications(), ["Risk trigger: bot_paused (buy EURUSD)"]);
    }

    #[tokio::test]
    async fn open_position_limit_uses_fresh_counters() {
        let h = Harness::new();
        h.connect_provider().await;
        h.store.set_open_positions("acct-9", 3).await.unwrap();

        let mut input = proposal();
        input.account_id = "acct-9".into();
        let out = engine(&h).evaluate_and_queue(input).await.unwrap();
        assert_eq!(out.deny_reason, Some(DenyReason::MaxOpenPositionsReached));
    }

    #[tokio::test]
    async fn trend_setup_flows_into_queue() {
        let h = Harness::new();
        h.connect_provider().await;

        let out = engine(&h)
            .evaluate_trend(TrendRequest {
                account_id: String::new(),
                symbol: "EURUSD".into(),
                spread_pips: 1.0,
                candles: uptrend_candles(120),
            })
            .await
            .unwrap();
        assert!(out.has_signal);
        let decision = out.decision.clone().unwrap();
        assert!(decision.allowed, "denied: {:?}", decision.deny_reason);
        assert_eq!(decision.command.unwrap().side, "BUY");

        let body = serde_json::to_value(&out).unwrap();
        assert_eq!(body["has_signal"], true);
        assert_eq!(body["allowed"], true);
        assert_eq!(body["strategy_signal"]["side"], "BUY");
        assert!(body.get("reason").is_none());
    }

    #[tokio::test]
    async fn flat_market_reports_reason_only() {
        let h = Harness::new();
        let out = engine(&h)
            .evaluate_trend(TrendRequest {
                symbol: "EURUSD".into(),
                candles: flat_candles(120),
                ..TrendRequest::default()
            })
            .await
            .unwrap();

        let body = serde_json::to_value(&out).unwrap();
        assert_eq!(body, json!({"has_signal": false, "reason": "no clear trend setup"}));
        assert!(h.store.list_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_and_short_series_are_rejected() {
        let h = Harness::new();
        let engine = engine(&h);

        let too_many = engine
            .evaluate_trend(TrendRequest {
                symbol: "EURUSD".into(),
                candles: uptrend_candles(301),
                ..TrendRequest::default()
            })
            .await;
        assert!(matches!(too_many, Err(BotError::Validation(_))));

        let too_few = engine
            .evaluate_trend(TrendRequest {
                symbol: "EURUSD".into(),
                candles: uptrend_candles(10),
                ..TrendRequest::default()
            })
            .await;
        assert!(matches!(too_few, Err(BotError::InsufficientData { .. })));
    }
}
