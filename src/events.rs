//! Operator-visible events about objects.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::Object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub namespace: String,
    pub involved_kind: String,
    pub involved_name: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new<T: Object>(
        object: &T,
        event_type: EventType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            namespace: object.namespace().to_string(),
            involved_kind: T::KIND.to_string(),
            involved_name: object.name().to_string(),
            event_type,
            reason: reason.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Best effort; failures are logged and swallowed.
    async fn record(&self, event: Event);

    async fn list(&self, namespace: &str) -> Result<Vec<Event>, StoreError>;
}

/// Records `event_type` `reason` about `object`.
pub async fn emit<T: Object>(
    recorder: &dyn EventRecorder,
    object: &T,
    event_type: EventType,
    reason: &str,
    message: impl Into<String>,
) {
    recorder
        .record(Event::new(object, event_type, reason, message))
        .await;
}

fn log_event(event: &Event) {
    match event.event_type {
        EventType::Normal => info!(
            kind = %event.involved_kind,
            object = %format!("{}/{}", event.namespace, event.involved_name),
            reason = %event.reason,
            "{}", event.message
        ),
        EventType::Warning => warn!(
            kind = %event.involved_kind,
            object = %format!("{}/{}", event.namespace, event.involved_name),
            reason = %event.reason,
            "{}", event.message
        ),
    }
}

/// Logs events and otherwise drops them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

#[async_trait]
impl EventRecorder for TracingRecorder {
    async fn record(&self, event: Event) {
        log_event(&event);
    }

    async fn list(&self, _namespace: &str) -> Result<Vec<Event>, StoreError> {
        Ok(Vec::new())
    }
}

/// Persists events to the `cluster_events` table.
#[derive(Clone)]
pub struct SqliteRecorder {
    pool: SqlitePool,
}

impl SqliteRecorder {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRecorder for SqliteRecorder {
    async fn record(&self, event: Event) {
        log_event(&event);
        let result = sqlx::query(
            "INSERT INTO cluster_events (namespace, involved_kind, involved_name, event_type, reason, message, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.namespace)
        .bind(&event.involved_kind)
        .bind(&event.involved_name)
        .bind(event.event_type.as_str())
        .bind(&event.reason)
        .bind(&event.message)
        .bind(event.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, reason = %event.reason, "failed to persist event");
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT namespace, involved_kind, involved_name, event_type, reason, message, timestamp
             FROM cluster_events WHERE namespace = ? ORDER BY id ASC",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_type: String = row.try_get("event_type")?;
            let timestamp: String = row.try_get("timestamp")?;
            events.push(Event {
                namespace: row.try_get("namespace")?,
                involved_kind: row.try_get("involved_kind")?,
                involved_name: row.try_get("involved_name")?,
                event_type: if event_type == "Warning" {
                    EventType::Warning
                } else {
                    EventType::Normal
                },
                reason: row.try_get("reason")?,
                message: row.try_get("message")?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|ts| ts.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(events)
    }
}

/// Keeps events in memory.
#[derive(Clone, Default)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(&self, event: Event) {
        log_event(&event);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events()
            .into_iter()
            .filter(|event| event.namespace == namespace)
            .collect())
    }
}
