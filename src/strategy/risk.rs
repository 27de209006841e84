//! Risk gating: signal + account state -> allow/deny.

use crate::config::RiskConfig;
use crate::domain::types::{AccountRiskState, DenyReason, RiskDecision, SignalInput};

/// Pure rule evaluator. Holds only limits; account state is passed in fresh on every call.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// First failing check wins. Order is significant: only one reason is reported.
    pub fn evaluate(&self, signal: &SignalInput, state: &AccountRiskState) -> RiskDecision {
        match self.first_violation(signal, state) {
            Some(reason) => RiskDecision::deny(reason),
            None => RiskDecision::allow(),
        }
    }

    fn first_violation(&self, signal: &SignalInput, state: &AccountRiskState) -> Option<DenyReason> {
        if state.paused {
            return Some(DenyReason::BotPaused);
        }
        if signal.symbol.trim().is_empty() {
            return Some(DenyReason::SymbolMissing);
        }
        if signal.side.trim().is_empty() {
            return Some(DenyReason::SideMissing);
        }
        if signal.stop_loss_pips <= 0.0 {
            return Some(DenyReason::StopLossRequired);
        }
        if signal.spread_pips > self.config.max_spread_pips {
            return Some(DenyReason::SpreadTooHigh);
        }
        if signal.confidence < self.config.min_confidence {
            return Some(DenyReason::AiConfidenceTooLow);
        }
        if state.open_positions >= self.config.max_open_positions {
            return Some(DenyReason::MaxOpenPositionsReached);
        }
        if state.daily_loss_pct >= self.config.max_daily_loss_pct {
            return Some(DenyReason::DailyLossLimitHit);
        }
        None
    }
}
