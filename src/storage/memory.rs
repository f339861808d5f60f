use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Object, ObjectKey, Selector};

use super::{ObjectClient, WatchEvent, WatchStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
}

/// A call made against a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub verb: Verb,
    pub key: ObjectKey,
}

impl Action {
    pub fn is_mutation(&self) -> bool {
        matches!(self.verb, Verb::Create | Verb::Update | Verb::Delete)
    }
}

type Failure = Box<dyn Fn(&ObjectKey) -> Option<StoreError> + Send + Sync>;

struct State<T> {
    objects: BTreeMap<ObjectKey, T>,
    next_version: u64,
    /// `None` unless built with [`MemoryStore::recording`].
    actions: Option<Vec<Action>>,
    failures: HashMap<Verb, Failure>,
}

/// Keeps objects in a map and can be told to fail. A store built with
/// [`MemoryStore::recording`] also logs every call, which is what the
/// controller tests rely on.
pub struct MemoryStore<T> {
    state: Mutex<State<T>>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Object> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Object> MemoryStore<T> {
    pub fn new() -> Self {
        Self::with_actions(None)
    }

    /// A store that keeps a log of every call for later inspection.
    pub fn recording() -> Self {
        Self::with_actions(Some(Vec::new()))
    }

    fn with_actions(actions: Option<Vec<Action>>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                next_version: 1,
                actions,
                failures: HashMap::new(),
            }),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces an object without recording an action.
    pub fn seed(&self, object: T) -> T {
        let mut state = self.state();
        let mut object = object;
        let version = state.next_version;
        state.next_version += 1;
        let meta = object.meta_mut();
        meta.uid.get_or_insert_with(|| Uuid::new_v4().to_string());
        meta.resource_version = Some(version.to_string());
        meta.generation.get_or_insert(1);
        state.objects.insert(object.key(), object.clone());
        object
    }

    /// Makes calls with `verb` fail whenever `failure` returns an error.
    pub fn fail_on<F>(&self, verb: Verb, failure: F)
    where
        F: Fn(&ObjectKey) -> Option<StoreError> + Send + Sync + 'static,
    {
        self.state().failures.insert(verb, Box::new(failure));
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn actions(&self) -> Vec<Action> {
        self.state().actions.clone().unwrap_or_default()
    }

    pub fn mutations(&self) -> Vec<Action> {
        self.actions()
            .into_iter()
            .filter(Action::is_mutation)
            .collect()
    }

    pub fn clear_actions(&self) {
        if let Some(actions) = self.state().actions.as_mut() {
            actions.clear();
        }
    }

    pub fn objects(&self) -> Vec<T> {
        self.state().objects.values().cloned().collect()
    }

    pub fn get_object(&self, namespace: &str, name: &str) -> Option<T> {
        self.state()
            .objects
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    fn begin(&self, verb: Verb, key: ObjectKey) -> Result<MutexGuard<'_, State<T>>, StoreError> {
        let mut state = self.state();
        if let Some(actions) = state.actions.as_mut() {
            actions.push(Action {
                verb,
                key: key.clone(),
            });
        }
        if let Some(err) = state.failures.get(&verb).and_then(|failure| failure(&key)) {
            return Err(err);
        }
        Ok(state)
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: T::KIND,
            key: key.to_string(),
        }
    }

    fn publish(&self, event: WatchEvent<T>) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl<T: Object> ObjectClient<T> for MemoryStore<T> {
    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        let key = ObjectKey::new(namespace, name);
        let state = self.begin(Verb::Get, key.clone())?;
        state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(&key))
    }

    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<T>, StoreError> {
        let state = self.begin(Verb::List, ObjectKey::new(namespace.unwrap_or_default(), ""))?;
        Ok(state
            .objects
            .values()
            .filter(|object| namespace.map_or(true, |ns| object.namespace() == ns))
            .filter(|object| object.matches(selector))
            .cloned()
            .collect())
    }

    async fn create(&self, object: &T) -> Result<T, StoreError> {
        let key = object.key();
        let created = {
            let mut state = self.begin(Verb::Create, key.clone())?;
            if object.name().is_empty() {
                return Err(StoreError::Invalid {
                    kind: T::KIND,
                    message: "metadata.name is required".to_string(),
                });
            }
            if state.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: T::KIND,
                    key: key.to_string(),
                });
            }

            let version = state.next_version;
            state.next_version += 1;
            let mut created = object.clone();
            let meta = created.meta_mut();
            meta.uid = Some(Uuid::new_v4().to_string());
            meta.resource_version = Some(version.to_string());
            meta.generation = Some(1);
            meta.creation_timestamp = Some(Time(Utc::now()));
            state.objects.insert(key, created.clone());
            created
        };

        self.publish(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, object: &T) -> Result<T, StoreError> {
        let key = object.key();
        let updated = {
            let mut state = self.begin(Verb::Update, key.clone())?;
            let previous = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| Self::not_found(&key))?;

            if let Some(expected) = object.resource_version() {
                if Some(expected) != previous.resource_version() {
                    return Err(StoreError::Conflict {
                        kind: T::KIND,
                        key: key.to_string(),
                    });
                }
            }

            object
                .check_update(&previous)
                .map_err(|message| StoreError::Invalid {
                    kind: T::KIND,
                    message,
                })?;

            let generation = previous.meta().generation.unwrap_or(1);
            let version = state.next_version;
            state.next_version += 1;
            let mut updated = object.clone();
            let bump = updated.bumps_generation(&previous);
            let meta = updated.meta_mut();
            meta.uid = previous.meta().uid.clone();
            meta.creation_timestamp = previous.meta().creation_timestamp.clone();
            meta.resource_version = Some(version.to_string());
            meta.generation = Some(if bump { generation + 1 } else { generation });
            state.objects.insert(key, updated.clone());
            updated
        };

        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = ObjectKey::new(namespace, name);
        let removed = {
            let mut state = self.begin(Verb::Delete, key.clone())?;
            state
                .objects
                .remove(&key)
                .ok_or_else(|| Self::not_found(&key))?
        };

        self.publish(WatchEvent::Deleted(removed));
        Ok(())
    }

    async fn watch(&self) -> Result<WatchStream<T>, StoreError> {
        let receiver = self.events.subscribe();
        let snapshot: Vec<T> = self.state().objects.values().cloned().collect();

        let initial = snapshot
            .into_iter()
            .map(|object| Ok(WatchEvent::Added(object)))
            .chain(std::iter::once(Ok(WatchEvent::Synced)));
        let live = BroadcastStream::new(receiver).map(|event| {
            event.map_err(|err| StoreError::Unavailable(format!("memory watch: {err}")))
        });

        Ok(Box::pin(stream::iter(initial).chain(live)))
    }
}
