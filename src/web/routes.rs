//! HTTP route handlers: agent protocol, admin surface and the OAuth connect flow.

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::domain::types::{AgentSession, Command, CommandResult, CommandType, SignalInput};
use crate::error::{BotError, Result};
use crate::store::DEFAULT_EVENT_LIMIT;
use crate::strategy::engine::TrendRequest;

use super::server::AppState;

/// Build all routes.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // Agent
        .route("/ea/register", post(register))
        .route("/ea/heartbeat", post(heartbeat))
        .route("/ea/sync", post(sync))
        .route("/ea/execute", post(execute))
        .route("/ea/result", post(result))
        // Admin
        .route("/bot/pause", post(pause))
        .route("/bot/resume", post(resume))
        .route("/dashboard/summary", get(dashboard))
        .route("/events", get(events))
        .route("/admin/signals/evaluate", post(evaluate_signal))
        .route("/admin/strategy/evaluate", post(evaluate_strategy))
        .route("/oauth/status", get(oauth_status))
        .route("/oauth/disconnect", post(oauth_disconnect))
        // OAuth handshake
        .route("/oauth/:provider/start", get(oauth_start))
        .route("/oauth/:provider/callback", get(oauth_callback))
}

impl IntoResponse for BotError {
    fn into_response(self) -> Response {
        let status = match &self {
            BotError::Validation(_) | BotError::InsufficientData { .. } | BotError::InvalidCandle(_) => {
                StatusCode::BAD_REQUEST
            }
            BotError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BotError::NotFound(_) => StatusCode::NOT_FOUND,
            BotError::InvalidTransition { .. } => StatusCode::CONFLICT,
            BotError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// `Authorization: Bearer <token>`, scheme matched case-insensitively.
fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Compares two secrets in time independent of where they first differ.
fn secrets_match(given: &str, expected: &str) -> bool {
    let (a, b) = (Sha256::digest(given.as_bytes()), Sha256::digest(expected.as_bytes()));
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Guard for operator routes.
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = BotError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(parts)
            .ok_or_else(|| BotError::Unauthorized("missing bearer token".into()))?;
        if !secrets_match(token, &state.config.auth.admin_api_token) {
            return Err(BotError::Unauthorized("invalid admin token".into()));
        }
        Ok(AdminAuth)
    }
}

/// The calling agent's validated session.
pub struct AgentAuth(pub AgentSession);

#[async_trait]
impl FromRequestParts<AppState> for AgentAuth {
    type Rejection = BotError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(parts)
            .ok_or_else(|| BotError::Unauthorized("missing bearer token".into()))?;
        match state.store.validate_session(token).await {
            Ok(session) => Ok(AgentAuth(session)),
            Err(e) if e.is_not_found() => Err(BotError::Unauthorized("invalid session token".into())),
            Err(e) => Err(e),
        }
    }
}

/// JSON body whose decode failures surface as validation errors.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = BotError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| BotError::Validation(e.body_text()))?;
        Ok(ApiJson(value))
    }
}

fn rfc3339(ts: chrono::DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Wire shape of a command handed to the agent.
fn command_view(cmd: &Command) -> Value {
    if cmd.command_type == CommandType::Noop {
        return json!({
            "command_id": cmd.id,
            "type": cmd.command_type,
            "expires_at": rfc3339(cmd.expires_at),
        });
    }
    json!({
        "command_id": cmd.id,
        "type": cmd.command_type,
        "symbol": cmd.symbol,
        "side": cmd.side,
        "volume": cmd.volume,
        "sl": cmd.sl,
        "tp": cmd.tp,
        "reason": cmd.reason,
        "expires_at": rfc3339(cmd.expires_at),
    })
}

/// GET /health
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "time": rfc3339(Utc::now()) }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    connect_code: String,
    #[serde(default)]
    account_id: String,
    #[serde(default)]
    device_id: String,
}

/// POST /ea/register: exchange the connect code for a session token.
async fn register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<Json<Value>> {
    if !secrets_match(&req.connect_code, &state.config.auth.ea_connect_code) {
        warn!(account_id = %req.account_id, "Agent registration with invalid connect code");
        return Err(BotError::Unauthorized("invalid connect code".into()));
    }
    let account_id = req.account_id.trim();
    let device_id = req.device_id.trim();
    if account_id.is_empty() || device_id.is_empty() {
        return Err(BotError::Validation("account_id and device_id are required".into()));
    }

    let session = state.store.issue_session(account_id, device_id).await?;
    info!(account_id, device_id, expires_at = %session.expires_at, "Agent registered");
    Ok(Json(json!({
        "token": session.token,
        "expires_at": rfc3339(session.expires_at),
        "scopes": session.scopes,
    })))
}

/// POST /ea/heartbeat
async fn heartbeat(State(state): State<AppState>, AgentAuth(session): AgentAuth) -> Result<Json<Value>> {
    state.store.touch_device(&session.device_id).await?;
    Ok(Json(json!({
        "ok": true,
        "server_time": rfc3339(Utc::now()),
        "paused": state.store.is_paused().await?,
    })))
}

/// POST /ea/sync: broker snapshot in, refreshed risk counters out.
async fn sync(
    State(state): State<AppState>,
    AgentAuth(session): AgentAuth,
    ApiJson(snapshot): ApiJson<Value>,
) -> Result<Json<Value>> {
    if !snapshot.is_object() {
        return Err(BotError::Validation("snapshot must be a JSON object".into()));
    }
    let out = state
        .breaker
        .ingest_snapshot(&session.account_id, &snapshot)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "open_positions": out.open_positions,
        "daily_loss_pct": out.daily_loss_pct,
        "triggered_circuit_breaker": out.triggered_circuit_breaker,
    })))
}

/// POST /ea/execute: next command, or NOOP.
async fn execute(State(state): State<AppState>, AgentAuth(session): AgentAuth) -> Result<Json<Value>> {
    let cmd = state.queue.poll(&session).await?;
    Ok(Json(command_view(&cmd)))
}

/// POST /ea/result
async fn result(
    State(state): State<AppState>,
    AgentAuth(session): AgentAuth,
    ApiJson(report): ApiJson<CommandResult>,
) -> Result<Json<Value>> {
    let out = state.queue.report_result(&session, &report).await?;
    Ok(Json(json!({ "ok": true, "event_id": out.event.id })))
}

/// POST /bot/pause
async fn pause(State(state): State<AppState>, _: AdminAuth) -> Result<Json<Value>> {
    let event = state.breaker.pause().await?;
    Ok(Json(json!({ "ok": true, "event_id": event.id })))
}

/// POST /bot/resume
async fn resume(State(state): State<AppState>, _: AdminAuth) -> Result<Json<Value>> {
    let event = state.breaker.resume().await?;
    Ok(Json(json!({ "ok": true, "event_id": event.id })))
}

#[derive(Debug, Deserialize)]
struct AccountQuery {
    account_id: Option<String>,
}

/// GET /dashboard/summary
async fn dashboard(
    State(state): State<AppState>,
    _: AdminAuth,
    Query(q): Query<AccountQuery>,
) -> Result<Json<Value>> {
    let account_id = q
        .account_id
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| state.config.risk.default_account_id.clone());
    let risk = state.store.risk_state(&account_id).await?;
    let provider = state.tokens.status().await?;
    let events = state.store.list_events(DEFAULT_EVENT_LIMIT).await?;

    Ok(Json(json!({
        "account_id": account_id,
        "mode": "paper",
        "paused": risk.paused,
        "open_positions": risk.open_positions,
        "daily_loss_pct": risk.daily_loss_pct,
        "ai_provider_connected": provider.connected,
        "last_events": events,
    })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<i64>,
}

/// GET /events
async fn events(
    State(state): State<AppState>,
    _: AdminAuth,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Value>> {
    let events = state.store.list_events(q.limit.unwrap_or(0)).await?;
    Ok(Json(json!({ "count": events.len(), "events": events })))
}

/// POST /admin/signals/evaluate
async fn evaluate_signal(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiJson(input): ApiJson<SignalInput>,
) -> Result<Json<Value>> {
    let out = state.signals.evaluate_and_queue(input).await?;
    Ok(Json(serde_json::to_value(out)?))
}

/// POST /admin/strategy/evaluate
async fn evaluate_strategy(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiJson(request): ApiJson<TrendRequest>,
) -> Result<Json<Value>> {
    let out = state.signals.evaluate_trend(request).await?;
    Ok(Json(serde_json::to_value(out)?))
}

/// GET /oauth/status
async fn oauth_status(State(state): State<AppState>, _: AdminAuth) -> Result<Json<Value>> {
    Ok(Json(serde_json::to_value(state.tokens.status().await?)?))
}

/// POST /oauth/disconnect
async fn oauth_disconnect(State(state): State<AppState>, _: AdminAuth) -> Result<Json<Value>> {
    state.tokens.disconnect().await?;
    Ok(Json(json!({ "ok": true, "provider": state.tokens.provider() })))
}

fn known_provider(state: &AppState, provider: &str) -> Result<()> {
    if provider != state.tokens.provider() {
        return Err(BotError::not_found(format!("oauth provider {provider}")));
    }
    Ok(())
}

/// GET /oauth/:provider/start
async fn oauth_start(State(state): State<AppState>, Path(provider): Path<String>) -> Result<Json<Value>> {
    known_provider(&state, &provider)?;
    let start = state.tokens.start_authorization().await?;
    Ok(Json(serde_json::to_value(start)?))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
}

/// GET /oauth/:provider/callback
async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(q): Query<CallbackQuery>,
) -> Result<Json<Value>> {
    known_provider(&state, &provider)?;
    if let Some(err) = q.error.filter(|e| !e.is_empty()) {
        return Err(BotError::Validation(format!("authorization denied: {err}")));
    }
    let (Some(oauth_state), Some(code)) = (
        q.state.filter(|s| !s.is_empty()),
        q.code.filter(|c| !c.is_empty()),
    ) else {
        return Err(BotError::Validation("state and code are required".into()));
    };

    state.tokens.complete_authorization(&oauth_state, &code).await?;
    Ok(Json(json!({ "connected": true, "provider": provider })))
}
