pub mod deployment_config;
pub mod image_stream;
pub mod rollout;

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Pod, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::deployutil::ENCODED_CONFIG_ANNOTATION;

pub use deployment_config::{
    CauseImageTrigger, CustomParams, DeploymentCause, DeploymentConfig, DeploymentConfigRollback,
    DeploymentConfigSpec, DeploymentConfigStatus, DeploymentDetails, DeploymentRequest,
    DeploymentStrategy, DeploymentTrigger, ImageChangeParams, LifecycleHook, RecreateParams,
    RollbackSpec, RollingParams, StrategyType, TagReference, TriggerType,
};
pub use image_stream::{ImageStream, NamedTagEventList, TagEvent};
pub use rollout::{Rollout, RolloutStatus};

/// Equality-based label selector.
pub type Selector = BTreeMap<String, String>;

/// Namespace/name identity used as the work queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A stored API object. Everything the store, the caches and the controllers
/// need to know about a kind goes through this trait.
pub trait Object:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: &'static str;
    /// Backing table in the SQLite store; also the watch `resource_type`.
    const TABLE: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Whether replacing `previous` with `self` must bump `metadata.generation`.
    fn bumps_generation(&self, _previous: &Self) -> bool {
        false
    }

    /// Rejects replacing `previous` with `self`, for fields that are fixed
    /// once written.
    fn check_update(&self, _previous: &Self) -> Result<(), String> {
        Ok(())
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.meta()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    fn matches(&self, selector: &Selector) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.label(key) == Some(value.as_str()))
    }
}

impl Object for Pod {
    const KIND: &'static str = "Pod";
    const TABLE: &'static str = "pods";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Object for ReplicationController {
    const KIND: &'static str = "ReplicationController";
    const TABLE: &'static str = "replication_controllers";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    /// The config snapshot a rollout was created from never changes.
    fn check_update(&self, previous: &Self) -> Result<(), String> {
        match previous.annotation(ENCODED_CONFIG_ANNOTATION) {
            Some(encoded) if self.annotation(ENCODED_CONFIG_ANNOTATION) != Some(encoded) => {
                Err(format!("annotation {ENCODED_CONFIG_ANNOTATION} cannot be changed"))
            }
            _ => Ok(()),
        }
    }
}

/// Sets an annotation, creating the map when missing.
pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: impl Into<String>) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.into());
}

pub fn remove_annotation(meta: &mut ObjectMeta, key: &str) {
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(key);
    }
}

pub fn set_label(meta: &mut ObjectMeta, key: &str, value: impl Into<String>) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.into());
}
