pub mod memory;
pub mod object_store;
pub mod watch_store;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::api::core::v1::Pod;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::StoreError;
use crate::models::{DeploymentConfig, ImageStream, Object, Rollout, Selector};

use self::memory::MemoryStore;
use self::object_store::ObjectStore;
use self::watch_store::WatchStore;

/// A change observed on the store.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Every object that existed when the watch started has been delivered.
    Synced,
}

pub type WatchStream<T> = Pin<Box<dyn Stream<Item = Result<WatchEvent<T>, StoreError>> + Send>>;

/// Authoritative access to one kind of object. Writes are checked against
/// `metadata.resourceVersion`.
#[async_trait]
pub trait ObjectClient<T: Object>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError>;

    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<T>, StoreError>;

    async fn create(&self, object: &T) -> Result<T, StoreError>;

    /// Replaces the stored object. Fails with `Conflict` when the object
    /// carries a resource version that is no longer current; an object
    /// without one is written unconditionally.
    async fn update(&self, object: &T) -> Result<T, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Every current object as `Added`, then `Synced`, then live changes.
    async fn watch(&self) -> Result<WatchStream<T>, StoreError>;
}

/// One client per kind the controllers work with.
#[derive(Clone)]
pub struct Clients {
    pub configs: Arc<dyn ObjectClient<DeploymentConfig>>,
    pub rollouts: Arc<dyn ObjectClient<Rollout>>,
    pub pods: Arc<dyn ObjectClient<Pod>>,
    pub image_streams: Arc<dyn ObjectClient<ImageStream>>,
}

/// In-process stores; handy for embedding and for tests.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub configs: Arc<MemoryStore<DeploymentConfig>>,
    pub rollouts: Arc<MemoryStore<Rollout>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub image_streams: Arc<MemoryStore<ImageStream>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores that log every call; see [`MemoryStore::recording`].
    pub fn recording() -> Self {
        Self {
            configs: Arc::new(MemoryStore::recording()),
            rollouts: Arc::new(MemoryStore::recording()),
            pods: Arc::new(MemoryStore::recording()),
            image_streams: Arc::new(MemoryStore::recording()),
        }
    }

    pub fn clients(&self) -> Clients {
        Clients {
            configs: self.configs.clone(),
            rollouts: self.rollouts.clone(),
            pods: self.pods.clone(),
            image_streams: self.image_streams.clone(),
        }
    }
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct Storage {
    pub pool: Arc<SqlitePool>,
    poll_interval: Duration,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
            poll_interval: Duration::from_millis(500),
        })
    }

    /// A private in-memory database, already migrated. All access goes
    /// through a single connection that is never recycled, since each
    /// SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let storage = Self {
            pool: Arc::new(pool),
            poll_interval: Duration::from_millis(50),
        };
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&*self.pool).await?;
        Ok(())
    }

    pub fn configs(&self) -> ObjectStore<DeploymentConfig> {
        ObjectStore::new((*self.pool).clone(), self.watch())
    }

    pub fn rollouts(&self) -> ObjectStore<Rollout> {
        ObjectStore::new((*self.pool).clone(), self.watch())
    }

    pub fn pods(&self) -> ObjectStore<Pod> {
        ObjectStore::new((*self.pool).clone(), self.watch())
    }

    pub fn image_streams(&self) -> ObjectStore<ImageStream> {
        ObjectStore::new((*self.pool).clone(), self.watch())
    }

    pub fn watch(&self) -> WatchStore {
        WatchStore::new((*self.pool).clone(), self.poll_interval)
    }

    pub fn clients(&self) -> Clients {
        Clients {
            configs: Arc::new(self.configs()),
            rollouts: Arc::new(self.rollouts()),
            pods: Arc::new(self.pods()),
            image_streams: Arc::new(self.image_streams()),
        }
    }
}
