//! Fixtures shared by the unit tests.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::codec::JsonCodec;
use crate::deployutil::{
    deployer_pod_name, make_rollout, set_replicas, DEPLOYER_POD_FOR_DEPLOYMENT_LABEL,
    DEPLOYMENT_ANNOTATION, STATUS_ANNOTATION,
};
use crate::models::{
    set_annotation, DeploymentConfig, DeploymentConfigSpec, DeploymentConfigStatus,
    DeploymentStrategy, DeploymentTrigger, ImageChangeParams, ImageStream, Object, Rollout,
    RolloutStatus, StrategyType, TagReference,
};

pub const NAMESPACE: &str = "test";
pub const IMAGE: &str = "registry.local/app@sha256:00000001";

/// A valid config at `version` with a config change trigger and one `web`
/// container.
pub fn ok_config(name: &str, version: i64) -> DeploymentConfig {
    DeploymentConfig {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: DeploymentConfigSpec {
            strategy: DeploymentStrategy {
                strategy_type: StrategyType::Recreate,
                ..Default::default()
            },
            triggers: vec![DeploymentTrigger::ConfigChange],
            replicas: 1,
            selector: BTreeMap::from([("app".to_string(), name.to_string())]),
            template: Some(ok_template(name, IMAGE)),
            ..Default::default()
        },
        status: DeploymentConfigStatus {
            latest_version: version,
            ..Default::default()
        },
    }
}

pub fn ok_template(app: &str, image: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "web".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

pub fn image_trigger(stream_tag: &str, automatic: bool, last_triggered: &str) -> DeploymentTrigger {
    DeploymentTrigger::ImageChange {
        params: ImageChangeParams {
            automatic,
            container_names: vec!["web".to_string()],
            from: TagReference::image_stream_tag("", stream_tag),
            last_triggered_image: last_triggered.to_string(),
        },
    }
}

pub fn container_image(config: &DeploymentConfig, container: &str) -> Option<String> {
    config
        .spec
        .template
        .as_ref()?
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)?
        .image
        .clone()
}

pub fn ok_rollout(config: &DeploymentConfig) -> Rollout {
    let mut rollout = make_rollout(config, &JsonCodec).unwrap_or_else(|e| panic!("{e}"));
    set_replicas(&mut rollout, config.spec.replicas);
    rollout
}

pub fn with_status(mut rollout: Rollout, status: RolloutStatus) -> Rollout {
    set_annotation(&mut rollout.metadata, STATUS_ANNOTATION, status.as_str());
    rollout
}

/// The worker pod of `rollout` in `phase`.
pub fn deployer_pod(rollout: &Rollout, phase: &str) -> Pod {
    let mut pod = Pod {
        metadata: ObjectMeta {
            name: Some(deployer_pod_name(rollout.name())),
            namespace: Some(rollout.namespace().to_string()),
            labels: Some(BTreeMap::from([(
                DEPLOYER_POD_FOR_DEPLOYMENT_LABEL.to_string(),
                rollout.name().to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    };
    set_annotation(&mut pod.metadata, DEPLOYMENT_ANNOTATION, rollout.name());
    pod
}

pub fn image_stream(name: &str, tag: &str, reference: &str) -> ImageStream {
    let mut stream = ImageStream {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    stream.push_tag(tag, reference, reference);
    stream
}
