//! Watch-fed read caches.
//!
//! Controllers read through a [`Lister`], which may lag the store. Anything
//! that must not act on stale data reads the store through an
//! [`ObjectClient`] instead.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{Object, ObjectKey, Selector};
use crate::storage::{ObjectClient, WatchEvent};

const REWATCH_DELAY: Duration = Duration::from_secs(1);

/// Read-only view of a cache. Returned objects are copies.
pub trait Lister<T>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<T>;
    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<T>;
}

/// Callbacks run by an [`Informer`] after the cache has been updated.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, object: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, object: &T);
}

/// What applying a watch event did to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}

pub struct Cache<T> {
    objects: RwLock<BTreeMap<ObjectKey, T>>,
    synced: AtomicBool,
    sync_notify: Notify,
}

impl<T: Object> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Object> Cache<T> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            synced: AtomicBool::new(false),
            sync_notify: Notify::new(),
        }
    }

    /// Replaces or inserts a copy of `object`.
    pub fn insert(&self, object: T) -> Option<T> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(object.key(), object)
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<T> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ObjectKey::new(namespace, name))
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a watch event. Events carrying an older resource version than
    /// the cached copy are dropped.
    pub fn apply(&self, event: WatchEvent<T>) -> Option<Change<T>> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                let key = object.key();
                match objects.get(&key) {
                    Some(cached) if is_older(&object, cached) => None,
                    Some(cached) if cached == &object => None,
                    Some(_) => {
                        let old = objects.insert(key, object.clone())?;
                        Some(Change::Updated { old, new: object })
                    }
                    None => {
                        objects.insert(key, object.clone());
                        Some(Change::Added(object))
                    }
                }
            }
            WatchEvent::Deleted(object) => objects.remove(&object.key()).map(Change::Deleted),
            WatchEvent::Synced => None,
        }
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
        self.sync_notify.notify_waiters();
    }

    /// Resolves once the initial listing has been applied.
    pub async fn wait_for_sync(&self) {
        loop {
            let notified = self.sync_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_synced() {
                return;
            }
            notified.await;
        }
    }
}

fn is_older<T: Object>(incoming: &T, cached: &T) -> bool {
    let version = |object: &T| object.resource_version().and_then(|rv| rv.parse::<u64>().ok());
    matches!((version(incoming), version(cached)), (Some(incoming), Some(cached)) if incoming < cached)
}

impl<T: Object> Lister<T> for Cache<T> {
    fn get(&self, namespace: &str, name: &str) -> Option<T> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<T> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|object| namespace.map_or(true, |ns| object.namespace() == ns))
            .filter(|object| object.matches(selector))
            .cloned()
            .collect()
    }
}

/// Keeps a [`Cache`] in step with a store watch and fans changes out to
/// handlers.
pub struct Informer<T: Object> {
    client: Arc<dyn ObjectClient<T>>,
    cache: Arc<Cache<T>>,
    handlers: Vec<Arc<dyn EventHandler<T>>>,
    resync: Option<Duration>,
}

impl<T: Object> Informer<T> {
    pub fn new(client: Arc<dyn ObjectClient<T>>) -> Self {
        Self {
            client,
            cache: Arc::new(Cache::new()),
            handlers: Vec::new(),
            resync: None,
        }
    }

    /// Redelivers every cached object as an update at this interval.
    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync = Some(period).filter(|period| !period.is_zero());
        self
    }

    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<T>>) {
        self.handlers.push(handler);
    }

    pub fn cache(&self) -> Arc<Cache<T>> {
        self.cache.clone()
    }

    /// Runs until the task is dropped, re-establishing the watch whenever it
    /// ends.
    pub async fn run(self) {
        loop {
            if let Err(e) = self.watch_once().await {
                warn!(kind = T::KIND, error = %e, "watch failed, restarting");
            }
            tokio::time::sleep(REWATCH_DELAY).await;
        }
    }

    async fn watch_once(&self) -> Result<(), StoreError> {
        let mut events = self.client.watch().await?;
        let mut listed: Option<HashSet<ObjectKey>> = Some(HashSet::new());

        let mut resync = self.resync.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            let event = match resync.as_mut() {
                Some(interval) => tokio::select! {
                    event = events.next() => event,
                    _ = interval.tick() => {
                        if self.cache.has_synced() {
                            self.resync_all();
                        }
                        continue;
                    }
                },
                None => events.next().await,
            };

            let Some(event) = event else {
                debug!(kind = T::KIND, "watch stream ended");
                return Ok(());
            };
            let event = event?;

            if let (Some(keys), WatchEvent::Added(object)) = (listed.as_mut(), &event) {
                keys.insert(object.key());
            }

            if matches!(event, WatchEvent::Synced) {
                if let Some(keys) = listed.take() {
                    self.drop_unlisted(&keys);
                }
                if !self.cache.has_synced() {
                    debug!(kind = T::KIND, objects = self.cache.len(), "cache synced");
                    self.cache.mark_synced();
                }
                continue;
            }

            if let Some(change) = self.cache.apply(event) {
                self.dispatch(&change);
            }
        }
    }

    /// Objects deleted while no watch was running.
    fn drop_unlisted(&self, listed: &HashSet<ObjectKey>) {
        for key in self.cache.keys() {
            if listed.contains(&key) {
                continue;
            }
            if let Some(object) = self.cache.remove(&key.namespace, &key.name) {
                self.dispatch(&Change::Deleted(object));
            }
        }
    }

    fn resync_all(&self) {
        for object in self.cache.list(None, &Selector::new()) {
            for handler in &self.handlers {
                handler.on_update(&object, &object);
            }
        }
    }

    fn dispatch(&self, change: &Change<T>) {
        for handler in &self.handlers {
            match change {
                Change::Added(object) => handler.on_add(object),
                Change::Updated { old, new } => handler.on_update(old, new),
                Change::Deleted(object) => handler.on_delete(object),
            }
        }
    }
}
