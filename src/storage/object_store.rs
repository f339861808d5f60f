use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Object, Selector};

use super::watch_store::{record_event, WatchStore};
use super::{ObjectClient, WatchEvent, WatchStream};

/// Stores one kind as JSON documents in `T::TABLE`.
pub struct ObjectStore<T> {
    pool: SqlitePool,
    watch: WatchStore,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Object> ObjectStore<T> {
    pub fn new(pool: SqlitePool, watch: WatchStore) -> Self {
        Self {
            pool,
            watch,
            _kind: PhantomData,
        }
    }

    fn not_found(namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: T::KIND,
            key: format!("{namespace}/{name}"),
        }
    }

    fn validate(object: &T) -> Result<(), StoreError> {
        if object.name().is_empty() {
            return Err(StoreError::Invalid {
                kind: T::KIND,
                message: "metadata.name is required".to_string(),
            });
        }
        if object.namespace().is_empty() {
            return Err(StoreError::Invalid {
                kind: T::KIND,
                message: "metadata.namespace is required".to_string(),
            });
        }
        Ok(())
    }

    /// The stored document with the metadata columns laid over it.
    fn decode_row(row: &SqliteRow) -> Result<T, StoreError> {
        let object: String = row.try_get("object")?;
        let resource_version: i64 = row.try_get("resource_version")?;
        let generation: i64 = row.try_get("generation")?;

        let mut object: T = serde_json::from_str(&object)?;
        let meta = object.meta_mut();
        meta.resource_version = Some(resource_version.to_string());
        meta.generation = Some(generation);
        Ok(object)
    }
}

#[async_trait]
impl<T: Object> ObjectClient<T> for ObjectStore<T> {
    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        let sql = format!(
            "SELECT resource_version, generation, object FROM {} WHERE namespace = ? AND name = ?",
            T::TABLE
        );
        let row = sqlx::query(&sql)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::decode_row(&row),
            None => Err(Self::not_found(namespace, name)),
        }
    }

    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<T>, StoreError> {
        let rows = match namespace {
            Some(namespace) => {
                let sql = format!(
                    "SELECT resource_version, generation, object FROM {} WHERE namespace = ? ORDER BY name",
                    T::TABLE
                );
                sqlx::query(&sql).bind(namespace).fetch_all(&self.pool).await?
            }
            None => {
                let sql = format!(
                    "SELECT resource_version, generation, object FROM {} ORDER BY namespace, name",
                    T::TABLE
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };

        let mut objects = Vec::with_capacity(rows.len());
        for row in &rows {
            let object = Self::decode_row(row)?;
            if object.matches(selector) {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    async fn create(&self, object: &T) -> Result<T, StoreError> {
        Self::validate(object)?;

        let now = Utc::now();
        let mut object = object.clone();
        let meta = object.meta_mut();
        meta.uid = Some(Uuid::new_v4().to_string());
        meta.resource_version = Some("1".to_string());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(now));

        let mut tx = self.pool.begin().await?;

        let exists_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE namespace = ? AND name = ?",
            T::TABLE
        );
        let existing: i64 = sqlx::query_scalar(&exists_sql)
            .bind(object.namespace())
            .bind(object.name())
            .fetch_one(&mut *tx)
            .await?;
        if existing > 0 {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                key: object.key().to_string(),
            });
        }

        let insert_sql = format!(
            "INSERT INTO {} (uid, name, namespace, resource_version, generation, creation_timestamp, labels, object)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            T::TABLE
        );
        sqlx::query(&insert_sql)
            .bind(object.meta().uid.as_deref())
            .bind(object.name())
            .bind(object.namespace())
            .bind(1i64)
            .bind(1i64)
            .bind(now.to_rfc3339())
            .bind(serde_json::to_string(&object.meta().labels)?)
            .bind(serde_json::to_string(&object)?)
            .execute(&mut *tx)
            .await?;

        record_event(&mut tx, "ADDED", &object).await?;
        tx.commit().await?;

        tracing::debug!(kind = T::KIND, key = %object.key(), "created");
        Ok(object)
    }

    async fn update(&self, object: &T) -> Result<T, StoreError> {
        Self::validate(object)?;

        let mut tx = self.pool.begin().await?;

        let select_sql = format!(
            "SELECT uid, resource_version, generation, creation_timestamp, object FROM {} WHERE namespace = ? AND name = ?",
            T::TABLE
        );
        let row = sqlx::query(&select_sql)
            .bind(object.namespace())
            .bind(object.name())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Self::not_found(object.namespace(), object.name()))?;

        let uid: String = row.try_get("uid")?;
        let current_version: i64 = row.try_get("resource_version")?;
        let generation: i64 = row.try_get("generation")?;
        let created: String = row.try_get("creation_timestamp")?;
        let previous: T = serde_json::from_str(&row.try_get::<String, _>("object")?)?;

        if let Some(expected) = object.resource_version() {
            if expected != current_version.to_string() {
                return Err(StoreError::Conflict {
                    kind: T::KIND,
                    key: object.key().to_string(),
                });
            }
        }

        object
            .check_update(&previous)
            .map_err(|message| StoreError::Invalid {
                kind: T::KIND,
                message,
            })?;

        let next_version = current_version + 1;
        let next_generation = if object.bumps_generation(&previous) {
            generation + 1
        } else {
            generation
        };

        let mut updated = object.clone();
        let meta = updated.meta_mut();
        meta.uid = Some(uid);
        meta.resource_version = Some(next_version.to_string());
        meta.generation = Some(next_generation);
        meta.creation_timestamp = DateTime::parse_from_rfc3339(&created)
            .ok()
            .map(|created| Time(created.with_timezone(&Utc)));

        let update_sql = format!(
            "UPDATE {} SET resource_version = ?, generation = ?, labels = ?, object = ?
             WHERE namespace = ? AND name = ? AND resource_version = ?",
            T::TABLE
        );
        let result = sqlx::query(&update_sql)
            .bind(next_version)
            .bind(next_generation)
            .bind(serde_json::to_string(&updated.meta().labels)?)
            .bind(serde_json::to_string(&updated)?)
            .bind(updated.namespace())
            .bind(updated.name())
            .bind(current_version)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key: updated.key().to_string(),
            });
        }

        record_event(&mut tx, "MODIFIED", &updated).await?;
        tx.commit().await?;

        tracing::debug!(kind = T::KIND, key = %updated.key(), resource_version = next_version, "updated");
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let select_sql = format!(
            "SELECT resource_version, generation, object FROM {} WHERE namespace = ? AND name = ?",
            T::TABLE
        );
        let row = sqlx::query(&select_sql)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Self::not_found(namespace, name))?;
        let object = Self::decode_row(&row)?;

        let delete_sql = format!("DELETE FROM {} WHERE namespace = ? AND name = ?", T::TABLE);
        sqlx::query(&delete_sql)
            .bind(namespace)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        record_event(&mut tx, "DELETED", &object).await?;
        tx.commit().await?;

        tracing::debug!(kind = T::KIND, key = %object.key(), "deleted");
        Ok(())
    }

    async fn watch(&self) -> Result<WatchStream<T>, StoreError> {
        // Read the log position before listing so no write is missed; a
        // write in between is replayed and the cache drops the older copy.
        let since = self.watch.latest_event_id(T::TABLE).await?;
        let snapshot = self.list(None, &Selector::new()).await?;

        let initial = snapshot
            .into_iter()
            .map(|object| Ok(WatchEvent::Added(object)))
            .chain(std::iter::once(Ok(WatchEvent::Synced)));

        Ok(Box::pin(
            stream::iter(initial).chain(self.watch.watch_stream::<T>(since)),
        ))
    }
}
