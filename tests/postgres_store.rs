//! PostgreSQL store tests. Skipped unless `MMBOT_TEST_DATABASE_URL` points at a scratch database.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Map};

use mmbot::config::DatabaseConfig;
use mmbot::db::pool;
use mmbot::domain::types::{CommandResult, CommandStatus, CommandType, EventType, NewCommand, OAuthState};
use mmbot::error::BotError;
use mmbot::store::{PgStore, Store};

async fn store() -> Option<Arc<PgStore>> {
    let url = std::env::var("MMBOT_TEST_DATABASE_URL").ok()?;
    let db = pool::connect(&DatabaseConfig {
        url,
        max_connections: 8,
    })
    .await
    .unwrap();
    Some(Arc::new(PgStore::new(db, Duration::hours(1))))
}

fn account() -> String {
    format!("acct-{}", uuid::Uuid::new_v4())
}

fn open_command(account_id: &str, ttl: Duration) -> NewCommand {
    let mut draft = NewCommand::new(account_id, CommandType::Open, Utc::now() + ttl);
    draft.symbol = "EURUSD".into();
    draft.side = "BUY".into();
    draft.volume = 0.01;
    draft
}

#[tokio::test]
async fn sessions_round_trip_by_token() {
    let Some(store) = store().await else { return };
    let account_id = account();

    let session = store.issue_session(&account_id, "dev-1").await.unwrap();
    let found = store.validate_session(&session.token).await.unwrap();
    assert_eq!(found.account_id, account_id);
    assert_eq!(found.device_id, "dev-1");
    assert_eq!(found.scopes.len(), 3);

    assert!(store.validate_session("unknown").await.unwrap_err().is_not_found());
    store.touch_device("dev-1").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pollers_never_share_a_command() {
    let Some(store) = store().await else { return };
    let account_id = account();
    for _ in 0..10 {
        store
            .enqueue_command(open_command(&account_id, Duration::seconds(60)))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        let account_id = account_id.clone();
        handles.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Ok(cmd) = store.next_queued_command(&account_id).await {
                got.push(cmd.id);
            }
            got
        }));
    }

    let mut seen = HashSet::new();
    for h in handles {
        for id in h.await.unwrap() {
            assert!(seen.insert(id), "command dispatched twice");
        }
    }
    assert_eq!(seen.len(), 10);
}

#[tokio::test]
async fn expired_commands_are_swept_and_results_apply_once() {
    let Some(store) = store().await else { return };
    let account_id = account();

    let stale = store
        .enqueue_command(open_command(&account_id, Duration::seconds(-1)))
        .await
        .unwrap();
    let live = store
        .enqueue_command(open_command(&account_id, Duration::seconds(60)))
        .await
        .unwrap();

    let claimed = store.next_queued_command(&account_id).await.unwrap();
    assert_eq!(claimed.id, live.id);
    assert_eq!(claimed.status, CommandStatus::Dispatched);
    assert_eq!(
        store.get_command(&stale.id).await.unwrap().status,
        CommandStatus::Failed
    );

    let result = CommandResult {
        command_id: live.id.clone(),
        status: "SUCCESS".into(),
        broker_ticket: "T-1".into(),
        ..Default::default()
    };
    let done = store.mark_command_result(&result).await.unwrap();
    assert_eq!(done.status, CommandStatus::Success);
    assert!(matches!(
        store.mark_command_result(&result).await,
        Err(BotError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn counters_events_and_oauth_state() {
    let Some(store) = store().await else { return };
    let account_id = account();
    store.issue_session(&account_id, "dev-2").await.unwrap();

    assert_eq!(store.adjust_open_positions(&account_id, -1).await.unwrap(), 0);
    assert_eq!(store.adjust_open_positions(&account_id, 2).await.unwrap(), 2);
    store.set_daily_loss(&account_id, 1.25).await.unwrap();
    assert_eq!(store.daily_loss(&account_id).await.unwrap(), 1.25);

    let mut payload = Map::new();
    payload.insert("marker".into(), json!(account_id));
    let event = store
        .append_event(EventType::SignalProposed, Some(&account_id), payload)
        .await
        .unwrap();
    let recent = store.list_events(50).await.unwrap();
    assert!(recent.iter().any(|e| e.id == event.id && e.payload["marker"] == account_id.as_str()));

    let state = uuid::Uuid::new_v4().to_string();
    store
        .save_oauth_state(OAuthState {
            state: state.clone(),
            provider: "openai".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    assert_eq!(store.consume_oauth_state(&state).await.unwrap().provider, "openai");
    assert!(store.consume_oauth_state(&state).await.unwrap_err().is_not_found());
}
