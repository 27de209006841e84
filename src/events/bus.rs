//! Event emission: append to the store, then publish to the webhook on a detached task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::domain::types::{Event, EventType};
use crate::error::Result;
use crate::events::publisher::EventPublisher;
use crate::store::Store;

/// Turn a `json!({...})` literal into an event payload. Non-objects become empty.
pub fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub struct EventBus {
    store: Arc<dyn Store>,
    publisher: Arc<EventPublisher>,
    delivery_timeout: Duration,
    shutdown: CancellationToken,
}

impl EventBus {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<EventPublisher>,
        delivery_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            publisher,
            delivery_timeout,
            shutdown,
        }
    }

    /// Persist the event, then hand it to the webhook without waiting for delivery.
    pub async fn emit(
        &self,
        event_type: EventType,
        account_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<Event> {
        let event = self.store.append_event(event_type, account_id, payload).await?;
        self.spawn_delivery(event.clone());
        Ok(event)
    }

    fn spawn_delivery(&self, event: Event) {
        if !self.publisher.is_enabled() {
            return;
        }
        let publisher = self.publisher.clone();
        let cancel = self.shutdown.child_token();
        let timeout = self.delivery_timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, publisher.publish(&event, &cancel)).await {
                Ok(Ok(())) => {
                    debug!(event_id = %event.id, event_type = %event.event_type, "Event published");
                }
                Ok(Err(e)) => {
                    error!(event_id = %event.id, event_type = %event.event_type, error = %e, "Event delivery abandoned");
                }
                Err(_) => {
                    error!(
                        event_id = %event.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Event delivery timed out"
                    );
                }
            }
        });
    }
}
