//! Outbound webhook delivery for domain events.
//!
//! At-least-once: every attempt carries the same idempotency key (the event id),
//! so the receiver deduplicates retries. Waits between attempts grow as
//! `min(base * 2^(n-1), max)` and are abandoned as soon as the shutdown token fires.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::domain::types::Event;
use crate::error::{BotError, Result};

/// Longest response-body prefix kept for error messages.
const ERROR_BODY_LIMIT: usize = 512;
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);

pub struct EventPublisher {
    client: reqwest::Client,
    webhook_url: String,
    max_retries: u32,
    retry_base: Duration,
    retry_max: Duration,
}

impl EventPublisher {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        let mut retry_base = Duration::from_millis(config.retry_base_ms);
        if retry_base.is_zero() {
            retry_base = DEFAULT_RETRY_BASE;
        }
        let retry_max = Duration::from_millis(config.retry_max_ms).max(retry_base);

        Ok(Self {
            client,
            webhook_url: config.url.trim().to_string(),
            max_retries: config.max_retries,
            retry_base,
            retry_max,
        })
    }

    /// An empty webhook URL turns publication into a no-op.
    pub fn is_enabled(&self) -> bool {
        !self.webhook_url.is_empty()
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_base.saturating_mul(factor).min(self.retry_max)
    }

    /// Deliver one event. Returns the last failure once every attempt is spent,
    /// or as soon as `cancel` fires.
    pub async fn publish(&self, event: &Event, cancel: &CancellationToken) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let body = serde_json::to_vec(event)?;
        let total = self.total_attempts();
        let mut last_error = String::new();

        for attempt in 1..=total {
            let send = self
                .client
                .post(&self.webhook_url)
                .header(CONTENT_TYPE, "application/json")
                .header("X-Event-ID", event.id.as_str())
                .header("X-Event-Type", event.event_type.as_str())
                .header("X-Idempotency-Key", event.id.as_str())
                .header("X-Delivery-Attempt", attempt.to_string())
                .body(body.clone())
                .send();

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BotError::Upstream(format!(
                        "delivery of event {} cancelled on attempt {attempt}",
                        event.id
                    )));
                }
                res = send => res,
            };

            match outcome {
                Ok(resp) if resp.status().is_success() => {
                    debug!(event_id = %event.id, attempt, "Event delivered");
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let snippet = read_prefix(resp, ERROR_BODY_LIMIT).await;
                    last_error = format!("webhook status={status} attempt={attempt} body={snippet}");
                }
                Err(e) => {
                    last_error = format!("webhook request failed attempt={attempt}: {e}");
                }
            }
            warn!(event_id = %event.id, attempt, total, error = %last_error, "Event delivery attempt failed");

            if attempt == total {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BotError::Upstream(format!(
                        "delivery of event {} cancelled after attempt {attempt}",
                        event.id
                    )));
                }
                _ = tokio::time::sleep(self.backoff(attempt)) => {}
            }
        }

        Err(BotError::Upstream(last_error))
    }
}

async fn read_prefix(mut resp: reqwest::Response, limit: usize) -> String {
    let mut buf = Vec::with_capacity(limit);
    while buf.len() < limit {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let take = (limit - buf.len()).min(chunk.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            _ => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
