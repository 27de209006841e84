//! Operator notifications over the Telegram Bot API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::TelegramConfig;

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Human-facing alert channel. Delivery is best effort and never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str);
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: Option<String>,
    chat_id: Option<String>,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        Self::with_api_base(config, TELEGRAM_API)
    }

    pub fn with_api_base(config: &TelegramConfig, api_base: &str) -> Self {
        let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: non_empty(&config.bot_token),
            chat_id: non_empty(&config.chat_id),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }

    async fn send_message(&self, token: &str, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, token);
        let resp = self
            .client
            .post(&url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("telegram sendMessage returned {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            debug!("telegram not configured, dropping notification");
            return;
        };
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.send_message(token, chat_id, text).await {
            warn!(error = %e, "failed to send telegram notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::Arc;

    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    async fn send_message(
        State(seen): State<Seen>,
        Path(bot): Path<String>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        seen.lock().push((bot, body));
        Json(json!({"ok": true}))
    }

    async fn spawn_api() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/:bot/sendMessage", post(send_message))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn sends_html_message_to_configured_chat() {
        let (base, seen) = spawn_api().await;
        let notifier = TelegramNotifier::with_api_base(
            &TelegramConfig {
                bot_token: Some("123:abc".into()),
                chat_id: Some("42".into()),
            },
            &base,
        );
        assert!(notifier.is_configured());
        notifier.notify("<b>paused</b>").await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "bot123:abc");
        assert_eq!(seen[0].1["chat_id"], "42");
        assert_eq!(seen[0].1["parse_mode"], "HTML");
        assert_eq!(seen[0].1["text"], "<b>paused</b>");
    }

    #[tokio::test]
    async fn unconfigured_notifier_stays_silent() {
        let (base, seen) = spawn_api().await;
        let notifier = TelegramNotifier::with_api_base(
            &TelegramConfig {
                bot_token: Some("123:abc".into()),
                chat_id: Some("  ".into()),
            },
            &base,
        );
        assert!(!notifier.is_configured());
        notifier.notify("hello").await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn unreachable_api_does_not_fail_caller() {
        let notifier = TelegramNotifier::with_api_base(
            &TelegramConfig {
                bot_token: Some("t".into()),
                chat_id: Some("c".into()),
            },
            "http://127.0.0.1:9",
        );
        notifier.notify("hello").await;
    }
}
