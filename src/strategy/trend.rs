//! Trend-following signal detection over an ascending candle series.
//!
//! Fast/slow EMA alignment with a slope filter, ATR-scaled stop and target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::domain::types::TradeSide;
use crate::error::{BotError, Result};

/// Minimum |fast - slow| / slow before a trend is considered.
const MIN_TREND_GAP_PCT: f64 = 0.0002;
/// Minimum |fast - fast_prev| / fast before a trend is considered.
const MIN_FAST_SLOPE_PCT: f64 = 0.00005;
const MIN_CONFIDENCE: f64 = 0.55;
const MAX_CONFIDENCE: f64 = 0.90;
const MIN_STOP_LOSS_PIPS: f64 = 8.0;

const NO_SETUP: &str = "no clear trend setup";

/// One OHLC price bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrendInput<'a> {
    pub symbol: &'a str,
    pub candles: &'a [Candle],
    pub spread_pips: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSignal {
    pub has_signal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<TradeSide>,
    pub confidence: f64,
    pub reason: String,
    pub stop_loss_pips: f64,
    pub take_profit_pips: f64,
}

impl TrendSignal {
    fn none() -> Self {
        Self {
            has_signal: false,
            side: None,
            confidence: 0.0,
            reason: NO_SETUP.into(),
            stop_loss_pips: 0.0,
            take_profit_pips: 0.0,
        }
    }
}

/// Stateless EMA/ATR trend detector.
#[derive(Debug, Clone)]
pub struct TrendSignalEngine {
    fast_period: usize,
    slow_period: usize,
    atr_period: usize,
}

impl Default for TrendSignalEngine {
    fn default() -> Self {
        Self::new(&StrategyConfig::default())
    }
}

impl TrendSignalEngine {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            fast_period: config.fast_period,
            slow_period: config.slow_period,
            atr_period: config.atr_period,
        }
    }

    pub fn min_candles(&self) -> usize {
        (self.slow_period + 2).max(self.atr_period + 2)
    }

    pub fn evaluate(&self, input: &TrendInput<'_>) -> Result<TrendSignal> {
        if input.symbol.trim().is_empty() {
            return Err(BotError::Validation("symbol is required".into()));
        }
        let required = self.min_candles();
        if input.candles.len() < required {
            return Err(BotError::InsufficientData {
                required,
                actual: input.candles.len(),
            });
        }
        if let Some(idx) = input
            .candles
            .iter()
            .position(|c| c.close <= 0.0 || c.high <= 0.0 || c.low <= 0.0)
        {
            return Err(BotError::InvalidCandle(idx));
        }

        let closes: Vec<f64> = input.candles.iter().map(|c| c.close).collect();
        let prev = &closes[..closes.len() - 1];

        let fast = ema(&closes, self.fast_period);
        let slow = ema(&closes, self.slow_period);
        let fast_prev = ema(prev, self.fast_period);
        let slow_prev = ema(prev, self.slow_period);
        let close = closes[closes.len() - 1];
        let atr_now = atr(input.candles, self.atr_period);

        let trend_gap_pct = (fast - slow).abs() / slow;
        let fast_slope_pct = (fast - fast_prev).abs() / fast;

        // Flat regimes produce too many false positives.
        if trend_gap_pct < MIN_TREND_GAP_PCT || fast_slope_pct < MIN_FAST_SLOPE_PCT {
            return Ok(TrendSignal::none());
        }

        let side = if close > fast && fast > slow && fast > fast_prev && slow >= slow_prev {
            TradeSide::Buy
        } else if close < fast && fast < slow && fast < fast_prev && slow <= slow_prev {
            TradeSide::Sell
        } else {
            return Ok(TrendSignal::none());
        };

        let (stop_loss_pips, take_profit_pips) = sl_tp_pips(input.symbol, atr_now);
        let reason = match side {
            TradeSide::Buy => format!(
                "trend-following long: close>EMA{}>EMA{} with positive slope",
                self.fast_period, self.slow_period
            ),
            TradeSide::Sell => format!(
                "trend-following short: close<EMA{}<EMA{} with negative slope",
                self.fast_period, self.slow_period
            ),
        };

        Ok(TrendSignal {
            has_signal: true,
            side: Some(side),
            confidence: confidence(close, fast, slow, atr_now),
            reason,
            stop_loss_pips,
            take_profit_pips,
        })
    }
}

/// EMA seeded with the first value.
fn ema(values: &[f64], period: usize) -> f64 {
    let Some((&first, rest)) = values.split_first() else {
        return 0.0;
    };
    if period <= 1 {
        return values[values.len() - 1];
    }
    let k = 2.0 / (period as f64 + 1.0);
    rest.iter().fold(first, |acc, v| v * k + acc * (1.0 - k))
}

/// Mean true range over the trailing `period` bars.
fn atr(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < 2 {
        return 0.0;
    }
    let start = candles.len().saturating_sub(period.max(1)).max(1);
    let window = &candles[start - 1..];
    let ranges: Vec<f64> = window
        .windows(2)
        .map(|pair| {
            let (prev, curr) = (pair[0], pair[1]);
            (curr.high - curr.low)
                .max((curr.high - prev.close).abs())
                .max((curr.low - prev.close).abs())
        })
        .collect();
    if ranges.is_empty() {
        return 0.0;
    }
    ranges.iter().sum::<f64>() / ranges.len() as f64
}

fn confidence(close: f64, fast: f64, slow: f64, atr_value: f64) -> f64 {
    if close <= 0.0 || slow <= 0.0 {
        return MIN_CONFIDENCE;
    }
    let trend_gap = (fast - slow).abs() / slow;
    let atr_pct = atr_value / close;

    let score = MIN_CONFIDENCE
        + (trend_gap * 12.0).min(0.25)
        + (atr_pct * 3.0).min(0.12)
        + ((close - fast).abs() / close * 20.0).min(0.08);
    score.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

fn sl_tp_pips(symbol: &str, atr_value: f64) -> (f64, f64) {
    let sl = ((atr_value / pip_size(symbol)) * 1.5).max(MIN_STOP_LOSS_PIPS);
    (sl, sl * 2.0)
}

pub fn pip_size(symbol: &str) -> f64 {
    if symbol.to_ascii_uppercase().contains("JPY") {
        0.01
    } else {
        0.0001
    }
}
