use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::Object;

/// Declarative description of an application rollout: the pod template to
/// run, how to roll it out, and what should cause a new version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeploymentConfigSpec,
    #[serde(default)]
    pub status: DeploymentConfigStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentConfigSpec {
    pub strategy: DeploymentStrategy,
    pub triggers: Vec<DeploymentTrigger>,
    pub replicas: i32,
    /// A test config runs its rollout once and then scales to zero.
    pub test: bool,
    pub paused: bool,
    pub selector: BTreeMap<String, String>,
    pub min_ready_seconds: i32,
    pub template: Option<PodTemplateSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentConfigStatus {
    pub latest_version: i64,
    pub observed_generation: i64,
    pub replicas: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<DeploymentDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentDetails {
    pub message: String,
    pub causes: Vec<DeploymentCause>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyType {
    #[default]
    Rolling,
    Recreate,
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentStrategy {
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_params: Option<CustomParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recreate_params: Option<RecreateParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_params: Option<RollingParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Extra labels for the worker pod.
    pub labels: BTreeMap<String, String>,
    /// Extra annotations for the worker pod.
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomParams {
    pub image: String,
    pub environment: Vec<EnvVar>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecreateParams {
    pub timeout_seconds: Option<i64>,
    pub pre: Option<LifecycleHook>,
    pub mid: Option<LifecycleHook>,
    pub post: Option<LifecycleHook>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollingParams {
    pub update_period_seconds: Option<i64>,
    pub interval_seconds: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub max_unavailable: Option<String>,
    pub max_surge: Option<String>,
    pub pre: Option<LifecycleHook>,
    pub post: Option<LifecycleHook>,
}

/// A hook runs in its own pod, created by the worker pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleHook {
    pub failure_policy: String,
    pub container_name: String,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
}

/// Reference to an image stream tag, `name` in `stream:tag` form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagReference {
    pub kind: String,
    /// Empty means the namespace of the referencing config.
    pub namespace: String,
    pub name: String,
}

impl TagReference {
    pub fn image_stream_tag(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: "ImageStreamTag".to_string(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            fallback
        } else {
            &self.namespace
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageChangeParams {
    pub automatic: bool,
    pub container_names: Vec<String>,
    pub from: TagReference,
    /// Last image this trigger resolved to. Empty until the first resolution.
    pub last_triggered_image: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    ConfigChange,
    ImageChange,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeploymentTrigger {
    ConfigChange,
    ImageChange {
        #[serde(rename = "imageChangeParams")]
        params: ImageChangeParams,
    },
    Manual,
}

impl DeploymentTrigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            DeploymentTrigger::ConfigChange => TriggerType::ConfigChange,
            DeploymentTrigger::ImageChange { .. } => TriggerType::ImageChange,
            DeploymentTrigger::Manual => TriggerType::Manual,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CauseImageTrigger {
    pub from: TagReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeploymentCause {
    ConfigChange,
    ImageChange {
        #[serde(rename = "imageTrigger")]
        image_trigger: CauseImageTrigger,
    },
    Manual,
}

impl DeploymentCause {
    /// Human readable reason recorded on the rollout created for this cause.
    pub fn message(&self) -> &'static str {
        match self {
            DeploymentCause::ConfigChange => "config change",
            DeploymentCause::ImageChange { .. } => "image change",
            DeploymentCause::Manual => "manual change",
        }
    }
}

/// Body of an instantiate call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentRequest {
    pub name: String,
    /// Resolve image triggers to their latest images before deciding.
    pub latest: bool,
    /// Instantiate even when no trigger fired.
    pub force: bool,
    pub exclude_triggers: Vec<TriggerType>,
}

/// Which parts of a historical config a rollback restores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollbackSpec {
    pub include_triggers: bool,
    pub include_template: bool,
    pub include_replication_meta: bool,
    pub include_strategy: bool,
}

/// Body of a rollback call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentConfigRollback {
    pub name: String,
    /// Version to roll back to; zero means the one before the latest.
    pub revision: i64,
    pub spec: RollbackSpec,
}

impl DeploymentConfig {
    pub fn image_change_params(&self) -> impl Iterator<Item = &ImageChangeParams> {
        self.spec.triggers.iter().filter_map(|trigger| match trigger {
            DeploymentTrigger::ImageChange { params } => Some(params),
            _ => None,
        })
    }

    pub fn has_config_change_trigger(&self) -> bool {
        self.spec
            .triggers
            .iter()
            .any(|trigger| matches!(trigger, DeploymentTrigger::ConfigChange))
    }

    /// Structural validation applied on create and update.
    pub fn validate(&self) -> Result<(), String> {
        let mut problems = Vec::new();

        if self.name().is_empty() {
            problems.push("metadata.name is required".to_string());
        }
        if self.spec.replicas < 0 {
            problems.push("spec.replicas must be non-negative".to_string());
        }

        let containers: Vec<&str> = self
            .spec
            .template
            .as_ref()
            .and_then(|template| template.spec.as_ref())
            .map(|spec| spec.containers.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default();
        if containers.is_empty() {
            problems.push("spec.template must define at least one container".to_string());
        }

        for params in self.image_change_params() {
            if !params.from.name.contains(':') {
                problems.push(format!(
                    "image change trigger source {:?} must be of the form <stream>:<tag>",
                    params.from.name
                ));
            }
            if params.container_names.is_empty() {
                problems.push(format!(
                    "image change trigger for {:?} must name at least one container",
                    params.from.name
                ));
            }
            for name in &params.container_names {
                if !containers.contains(&name.as_str()) {
                    problems.push(format!(
                        "image change trigger for {:?} names unknown container {:?}",
                        params.from.name, name
                    ));
                }
            }
        }

        if self.spec.strategy.strategy_type == StrategyType::Custom
            && self.spec.strategy.custom_params.is_none()
        {
            problems.push("custom strategy requires customParams".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

impl Object for DeploymentConfig {
    const KIND: &'static str = "DeploymentConfig";
    const TABLE: &'static str = "deployment_configs";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn bumps_generation(&self, previous: &Self) -> bool {
        self.spec != previous.spec || self.status.latest_version != previous.status.latest_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn triggers_serialize_as_tagged_variants() {
        let triggers = vec![
            DeploymentTrigger::ConfigChange,
            DeploymentTrigger::ImageChange {
                params: ImageChangeParams {
                    automatic: true,
                    container_names: vec!["web".into()],
                    from: TagReference::image_stream_tag("", "app:latest"),
                    last_triggered_image: String::new(),
                },
            },
        ];

        let value = serde_json::to_value(&triggers).unwrap();
        assert_eq!(value[0], json!({ "type": "ConfigChange" }));
        assert_eq!(value[1]["type"], "ImageChange");
        assert_eq!(value[1]["imageChangeParams"]["from"]["name"], "app:latest");

        let back: Vec<DeploymentTrigger> = serde_json::from_value(value).unwrap();
        assert_eq!(back, triggers);
    }

    #[test]
    fn generation_bumps_on_spec_or_latest_version_only() {
        let base = DeploymentConfig::default();

        let mut observed = base.clone();
        observed.status.observed_generation = 4;
        assert!(!observed.bumps_generation(&base));

        let mut deployed = base.clone();
        deployed.status.latest_version = 1;
        assert!(deployed.bumps_generation(&base));

        let mut paused = base.clone();
        paused.spec.paused = true;
        assert!(paused.bumps_generation(&base));
    }

    #[test]
    fn validate_rejects_triggers_for_unknown_containers() {
        let config: DeploymentConfig = serde_json::from_value(json!({
            "metadata": { "name": "app", "namespace": "ns" },
            "spec": {
                "replicas": 1,
                "template": { "spec": { "containers": [{ "name": "web", "image": "x" }] } },
                "triggers": [{
                    "type": "ImageChange",
                    "imageChangeParams": {
                        "automatic": true,
                        "containerNames": ["worker"],
                        "from": { "kind": "ImageStreamTag", "name": "app:latest" }
                    }
                }]
            }
        }))
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.contains("unknown container \"worker\""), "{err}");
    }
}
