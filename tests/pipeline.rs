//! End-to-end HTTP tests over the in-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use mmbot::config::Config;
use mmbot::domain::types::ProviderConnection;
use mmbot::store::{MemoryStore, Store};
use mmbot::telegram::notifier::Notifier;
use mmbot::web::server::{router, AppState};

const ADMIN: &str = "admin-token";
const CONNECT_CODE: &str = "MMBOT-ONE-TIME-CODE";

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, text: &str) {
        self.messages.lock().push(text.to_string());
    }
}

struct App {
    base: String,
    http: reqwest::Client,
    store: Arc<dyn Store>,
    notes: Arc<Recorder>,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.admin_api_token = ADMIN.into();
    config.auth.ea_connect_code = CONNECT_CODE.into();
    config
}

async fn spawn_app(config: Config) -> App {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(config.store.session_ttl()));
    let notes = Arc::new(Recorder::default());
    let state = AppState::build(config, store.clone(), notes.clone(), CancellationToken::new()).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    App {
        base: format!("http://{addr}"),
        http: reqwest::Client::new(),
        store,
        notes,
    }
}

impl App {
    async fn call(&self, method: reqwest::Method, path: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn post(&self, path: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.call(reqwest::Method::POST, path, Some(token), Some(body)).await
    }

    async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.call(reqwest::Method::GET, path, token, None).await
    }

    async fn register(&self, account_id: &str) -> String {
        let (status, body) = self
            .call(
                reqwest::Method::POST,
                "/ea/register",
                None,
                Some(json!({
                    "connect_code": CONNECT_CODE,
                    "account_id": account_id,
                    "device_id": format!("{account_id}-terminal"),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["token"].as_str().unwrap().to_string()
    }

    async fn connect_provider(&self) {
        let now = Utc::now();
        self.store
            .save_provider_connection(ProviderConnection {
                provider: "openai".into(),
                access_token: "at".into(),
                refresh_token: "rt".into(),
                scopes: vec!["models.read".into()],
                expires_at: now + Duration::hours(1),
                connected_at: now,
            })
            .await
            .unwrap();
    }
}

fn signal(confidence: f64) -> Value {
    json!({
        "symbol": "EURUSD",
        "side": "buy",
        "confidence": confidence,
        "reason": "breakout",
        "spread_pips": 1.0,
        "stop_loss_pips": 12.0,
        "take_profit_pips": 24.0,
    })
}

fn uptrend(n: usize) -> Value {
    let candles: Vec<Value> = (0..n)
        .map(|i| {
            let mut close = 1.0800 + i as f64 * 0.00065;
            if i % 9 == 0 {
                close -= 0.0002;
            }
            json!({
                "time": Utc.timestamp_opt(1_700_000_000 + i as i64 * 900, 0).unwrap(),
                "open": close - 0.0002,
                "high": close + 0.0008,
                "low": close - 0.0010,
                "close": close,
            })
        })
        .collect();
    Value::Array(candles)
}

#[tokio::test]
async fn health_is_public() {
    let app = spawn_app(test_config()).await;
    let (status, body) = app.get("/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn registration_requires_connect_code_and_ids() {
    let app = spawn_app(test_config()).await;

    let (status, _) = app
        .call(
            reqwest::Method::POST,
            "/ea/register",
            None,
            Some(json!({"connect_code": "wrong", "account_id": "a", "device_id": "d"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(
            reqwest::Method::POST,
            "/ea/register",
            None,
            Some(json!({"connect_code": CONNECT_CODE, "account_id": "", "device_id": "d"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .call(
            reqwest::Method::POST,
            "/ea/register",
            None,
            Some(json!({"connect_code": CONNECT_CODE, "account_id": "paper-1", "device_id": "d"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scopes"], json!(["trade:execute", "trade:read", "account:read"]));
}

#[tokio::test]
async fn protected_routes_reject_missing_or_wrong_tokens() {
    let app = spawn_app(test_config()).await;

    let (status, body) = app.get("/events", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = app.get("/events", Some("nope")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.post("/ea/execute", "not-a-session", json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Admin token is not an agent session, and vice versa.
    let agent = app.register("paper-1").await;
    let (status, _) = app.post("/bot/pause", &agent, json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = app.post("/ea/heartbeat", ADMIN, json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signal_to_execution_round_trip() {
    let app = spawn_app(test_config()).await;
    let agent = app.register("paper-1").await;

    // Empty queue: NOOP with only id, type and expiry.
    let (status, noop) = app.post("/ea/execute", &agent, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(noop["type"], "NOOP");
    assert!(noop.get("symbol").is_none());

    // No provider connection: fail closed.
    let (_, denied) = app.post("/admin/signals/evaluate", ADMIN, signal(0.8)).await;
    assert_eq!(denied["allowed"], false);
    assert_eq!(denied["deny_reason"], "provider_unavailable_fail_closed");

    app.connect_provider().await;

    let (_, low) = app.post("/admin/signals/evaluate", ADMIN, signal(0.5)).await;
    assert_eq!(low["deny_reason"], "ai_confidence_too_low");

    let (status, allowed) = app.post("/admin/signals/evaluate", ADMIN, signal(0.8)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(allowed["allowed"], true);
    let command_id = allowed["command"]["command_id"].as_str().unwrap().to_string();
    assert_eq!(allowed["command"]["side"], "BUY");

    let (_, cmd) = app.post("/ea/execute", &agent, json!({})).await;
    assert_eq!(cmd["command_id"], command_id.as_str());
    assert_eq!(cmd["type"], "OPEN");
    assert_eq!(cmd["volume"], 0.01);
    assert_eq!(cmd["sl"], 12.0);

    // Dispatched exactly once.
    let (_, next) = app.post("/ea/execute", &agent, json!({})).await;
    assert_eq!(next["type"], "NOOP");

    let (status, ok) = app
        .post(
            "/ea/result",
            &agent,
            json!({"command_id": command_id, "status": "SUCCESS", "broker_ticket": "T-77"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ok["ok"], true);
    assert!(ok["event_id"].is_string());

    let (status, _) = app
        .post("/ea/result", &agent, json!({"command_id": command_id, "status": "FAILED"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, summary) = app.get("/dashboard/summary", Some(ADMIN)).await;
    assert_eq!(summary["account_id"], "paper-1");
    assert_eq!(summary["mode"], "paper");
    assert_eq!(summary["open_positions"], 1);
    assert_eq!(summary["ai_provider_connected"], true);
    assert_eq!(summary["last_events"][0]["event_type"], "TradeExecuted");

    let (_, events) = app.get("/events?limit=2", Some(ADMIN)).await;
    assert_eq!(events["count"], 2);

    assert!(app
        .notes
        .messages
        .lock()
        .iter()
        .any(|m| m == "[OPEN] BUY EURUSD 0.01"));
}

#[tokio::test]
async fn circuit_breaker_blocks_until_resume() {
    let app = spawn_app(test_config()).await;
    let agent = app.register("paper-1").await;
    app.connect_provider().await;

    let (status, sync) = app
        .post(
            "/ea/sync",
            &agent,
            json!({"equity": 1000.0, "daily_pnl": -30.0, "positions": [{"profit": -30.0}]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sync["triggered_circuit_breaker"], true);
    assert_eq!(sync["open_positions"], 1);

    let (_, beat) = app.post("/ea/heartbeat", &agent, json!({})).await;
    assert_eq!(beat["paused"], true);

    let (_, denied) = app.post("/admin/signals/evaluate", ADMIN, signal(0.9)).await;
    assert_eq!(denied["deny_reason"], "bot_paused");

    // A healthy snapshot alone does not lift the pause.
    app.post("/ea/sync", &agent, json!({"equity": 1000.0, "daily_pnl": 5.0}))
        .await;
    let (_, beat) = app.post("/ea/heartbeat", &agent, json!({})).await;
    assert_eq!(beat["paused"], true);

    let (status, _) = app.post("/bot/resume", ADMIN, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, allowed) = app.post("/admin/signals/evaluate", ADMIN, signal(0.9)).await;
    assert_eq!(allowed["allowed"], true);

    let (status, _) = app.post("/ea/sync", &agent, json!([1, 2])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn trend_evaluation_over_http() {
    let app = spawn_app(test_config()).await;
    app.connect_provider().await;

    let (status, body) = app
        .post(
            "/admin/strategy/evaluate",
            ADMIN,
            json!({"symbol": "EURUSD", "spread_pips": 1.0, "candles": uptrend(120)}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["has_signal"], true);
    assert_eq!(body["strategy_signal"]["side"], "BUY");
    assert_eq!(body["allowed"], true);

    let (status, body) = app
        .post(
            "/admin/strategy/evaluate",
            ADMIN,
            json!({"symbol": "EURUSD", "candles": uptrend(10)}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("52"));
}

type Forms = Arc<Mutex<Vec<Value>>>;

async fn spawn_token_endpoint() -> (String, Forms) {
    let forms: Forms = Arc::default();
    let seen = forms.clone();
    let app = Router::new().route(
        "/token",
        post(move |body: String| {
            let seen = seen.clone();
            async move {
                seen.lock().push(Value::String(body));
                Json(json!({
                    "access_token": "at-live",
                    "refresh_token": "rt-live",
                    "expires_in": 3600,
                    "scope": "models.read",
                }))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/token"), forms)
}

#[tokio::test]
async fn oauth_connect_flow() {
    let (token_url, forms) = spawn_token_endpoint().await;
    let mut config = test_config();
    config.oauth.client_id = "client-1".into();
    config.oauth.client_secret = "secret-1".into();
    config.oauth.token_url = token_url;
    let app = spawn_app(config).await;

    let (status, _) = app.get("/oauth/other/start", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, start) = app.get("/oauth/openai/start", None).await;
    assert_eq!(status, StatusCode::OK);
    let state = start["state"].as_str().unwrap().to_string();
    assert!(start["auth_url"].as_str().unwrap().contains(&state));

    let (status, _) = app.get("/oauth/openai/callback?code=abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let callback = format!("/oauth/openai/callback?state={state}&code=abc");
    let (status, done) = app.get(&callback, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done, json!({"connected": true, "provider": "openai"}));
    assert_eq!(forms.lock().len(), 1);

    // State is single use.
    let (status, _) = app.get(&callback, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, status_body) = app.get("/oauth/status", Some(ADMIN)).await;
    assert_eq!(status_body["connected"], true);
    assert_eq!(status_body["scopes"], json!(["models.read"]));

    let (status, _) = app.post("/oauth/disconnect", ADMIN, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, status_body) = app.get("/oauth/status", Some(ADMIN)).await;
    assert_eq!(status_body["connected"], false);
}
