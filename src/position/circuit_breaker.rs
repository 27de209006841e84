//! Position sync and the daily-loss circuit breaker.
//!
//! Snapshots from the agent overwrite the per-account counters. Crossing the
//! loss threshold latches the global pause; only an explicit resume clears it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::domain::types::{Event, EventType};
use crate::error::Result;
use crate::events::bus::{payload, EventBus};
use crate::store::Store;
use crate::strategy::accounting::derive_snapshot_metrics;
use crate::telegram::notifier::Notifier;

pub const TRIP_REASON: &str = "daily_loss_limit_hit_sync";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub open_positions: i64,
    pub daily_loss_pct: f64,
    pub triggered_circuit_breaker: bool,
}

pub struct CircuitBreaker {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    max_daily_loss_pct: f64,
    /// Serializes check-and-trip so one breach produces one pair of events.
    trip: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        max_daily_loss_pct: f64,
    ) -> Self {
        Self {
            store,
            events,
            notifier,
            max_daily_loss_pct,
            trip: Mutex::new(()),
        }
    }

    pub async fn ingest_snapshot(&self, account_id: &str, snapshot: &Value) -> Result<SyncOutcome> {
        self.store.save_position_snapshot(account_id, snapshot).await?;

        let metrics = derive_snapshot_metrics(snapshot);
        self.store
            .set_open_positions(account_id, metrics.open_positions)
            .await?;
        self.store
            .set_daily_loss(account_id, metrics.daily_loss_pct)
            .await?;

        let mut triggered = false;
        if metrics.daily_loss_pct >= self.max_daily_loss_pct {
            let _guard = self.trip.lock().await;
            if !self.store.is_paused().await? {
                self.store.set_paused(true).await?;
                triggered = true;

                self.events
                    .emit(
                        EventType::RiskTriggered,
                        Some(account_id),
                        payload(json!({
                            "reason": TRIP_REASON,
                            "daily_loss_pct": metrics.daily_loss_pct,
                            "threshold_pct": self.max_daily_loss_pct,
                            "net_pnl": metrics.net_pnl,
                            "equity": metrics.equity,
                        })),
                    )
                    .await?;
                self.events
                    .emit(
                        EventType::BotPaused,
                        Some(account_id),
                        payload(json!({"paused": true, "source": "risk_circuit_breaker"})),
                    )
                    .await?;

                error!(
                    account_id,
                    daily_loss_pct = metrics.daily_loss_pct,
                    threshold_pct = self.max_daily_loss_pct,
                    "Daily loss circuit breaker tripped, bot paused"
                );
                self.notifier
                    .notify(&format!(
                        "Daily loss circuit breaker triggered: {:.2}% >= {:.2}%. Bot paused.",
                        metrics.daily_loss_pct, self.max_daily_loss_pct
                    ))
                    .await;
            }
        }

        info!(
            account_id,
            open_positions = metrics.open_positions,
            daily_loss_pct = metrics.daily_loss_pct,
            triggered,
            "Positions synced"
        );

        Ok(SyncOutcome {
            open_positions: metrics.open_positions,
            daily_loss_pct: metrics.daily_loss_pct,
            triggered_circuit_breaker: triggered,
        })
    }

    /// Operator pause. Blocks new OPEN commands until [`resume`](Self::resume).
    pub async fn pause(&self) -> Result<Event> {
        self.set_paused_by_admin(true).await
    }

    pub async fn resume(&self) -> Result<Event> {
        self.set_paused_by_admin(false).await
    }

    async fn set_paused_by_admin(&self, paused: bool) -> Result<Event> {
        let guard = self.trip.lock().await;
        self.store.set_paused(paused).await?;
        let event = self
            .events
            .emit(
                EventType::BotPaused,
                None,
                payload(json!({"paused": paused, "source": "admin"})),
            )
            .await?;
        drop(guard);

        info!(paused, "Pause flag set by operator");
        let text = if paused {
            "MMBot paused: new OPEN commands are blocked."
        } else {
            "MMBot resumed: OPEN commands are allowed again."
        };
        self.notifier.notify(text).await;
        Ok(event)
    }
}
