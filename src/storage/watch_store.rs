use std::time::Duration;

use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::error::StoreError;
use crate::models::Object;

use super::{WatchEvent, WatchStream};

const BATCH_SIZE: i64 = 100;

/// Reads the `events` log that every store write appends to.
#[derive(Clone)]
pub struct WatchStore {
    pool: SqlitePool,
    poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: i64,
    pub event_type: String,
    pub object: String,
}

impl WatchStore {
    pub fn new(pool: SqlitePool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    pub async fn latest_event_id(&self, resource_type: &str) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(id), 0) FROM events WHERE resource_type = ?",
        )
        .bind(resource_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn events_since(
        &self,
        resource_type: &str,
        since_id: i64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, event_type, object FROM events
             WHERE resource_type = ? AND id > ?
             ORDER BY id ASC
             LIMIT ?",
        )
        .bind(resource_type)
        .bind(since_id)
        .bind(BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StoredEvent, StoreError> {
                Ok(StoredEvent {
                    id: row.try_get("id")?,
                    event_type: row.try_get("event_type")?,
                    object: row.try_get("object")?,
                })
            })
            .collect()
    }

    /// Polls the log for changes to `T` recorded after `since_id`. The stream
    /// ends after the first read error.
    pub fn watch_stream<T: Object>(&self, since_id: i64) -> WatchStream<T> {
        let store = self.clone();
        let stream = async_stream::stream! {
            let mut last_id = since_id;
            loop {
                match store.events_since(T::TABLE, last_id).await {
                    Ok(events) => {
                        let drained = (events.len() as i64) < BATCH_SIZE;
                        for event in events {
                            last_id = event.id;
                            match decode_event::<T>(&event) {
                                Ok(Some(decoded)) => yield Ok(decoded),
                                Ok(None) => {
                                    tracing::warn!(id = event.id, event_type = %event.event_type, "skipping unknown watch event");
                                }
                                Err(e) => yield Err(e),
                            }
                        }
                        if !drained {
                            continue;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }

                tokio::time::sleep(store.poll_interval).await;
            }
        };

        Box::pin(stream)
    }
}

fn decode_event<T: Object>(event: &StoredEvent) -> Result<Option<WatchEvent<T>>, StoreError> {
    let object: T = serde_json::from_str(&event.object)?;
    Ok(match event.event_type.as_str() {
        "ADDED" => Some(WatchEvent::Added(object)),
        "MODIFIED" => Some(WatchEvent::Modified(object)),
        "DELETED" => Some(WatchEvent::Deleted(object)),
        _ => None,
    })
}

/// Appends a change to the watch log. Runs on the caller's connection so it
/// commits together with the write it describes.
pub(crate) async fn record_event<T: Object>(
    conn: &mut SqliteConnection,
    event_type: &str,
    object: &T,
) -> Result<(), StoreError> {
    let resource_version = object
        .resource_version()
        .and_then(|rv| rv.parse::<i64>().ok())
        .unwrap_or_default();

    sqlx::query(
        "INSERT INTO events (resource_type, resource_uid, resource_name, resource_namespace, event_type, resource_version, timestamp, object)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(T::TABLE)
    .bind(object.meta().uid.as_deref().unwrap_or_default())
    .bind(object.name())
    .bind(object.namespace())
    .bind(event_type)
    .bind(resource_version)
    .bind(Utc::now().to_rfc3339())
    .bind(serde_json::to_string(object)?)
    .execute(conn)
    .await?;

    Ok(())
}
