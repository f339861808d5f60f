//! Naming, annotation keys and conversions shared by every component that
//! reads or writes rollout state.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Pod, PodTemplateSpec, ReplicationControllerSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::codec::{CodecError, ConfigCodec};
use crate::models::{
    set_annotation, DeploymentConfig, Object, Rollout, RolloutStatus, Selector,
};

pub const ENCODED_CONFIG_ANNOTATION: &str = "krollout.io/encoded-deployment-config";
pub const STATUS_ANNOTATION: &str = "krollout.io/deployment.phase";
pub const VERSION_ANNOTATION: &str = "krollout.io/deployment-config.latest-version";
pub const CANCELLED_ANNOTATION: &str = "krollout.io/deployment.cancelled";
pub const CANCELLED_ANNOTATION_VALUE: &str = "true";
pub const STATUS_REASON_ANNOTATION: &str = "krollout.io/deployment.status-reason";
/// Name of the owning config, on rollouts and worker pods.
pub const CONFIG_ANNOTATION: &str = "krollout.io/deployment-config.name";
/// Name of the owning rollout, on worker pods.
pub const DEPLOYMENT_ANNOTATION: &str = "krollout.io/deployment.name";
/// Name of the worker pod, on rollouts.
pub const DEPLOYER_POD_ANNOTATION: &str = "krollout.io/deployer-pod.name";
/// Reserved label tying worker and hook pods to their rollout.
pub const DEPLOYER_POD_FOR_DEPLOYMENT_LABEL: &str = "krollout.io/deployer-pod-for.name";
pub const CONFIG_LABEL: &str = "krollout.io/deployment-config.name";
pub const DEPLOYMENT_LABEL: &str = "deployment";
/// Replica count the worker pod scales the rollout to.
pub const DESIRED_REPLICAS_ANNOTATION: &str = "krollout.io/desired-replicas";

pub const REASON_CANCELLED_BY_USER: &str = "cancelled by user";
pub const REASON_NEWER_DEPLOYMENT_EXISTS: &str = "newer deployment was found running";
pub const REASON_UNRELATED_DEPLOYMENT_EXISTS: &str = "unrelated deployment exists";
pub const REASON_DEPLOYER_POD_NO_LONGER_EXISTS: &str = "deployer pod no longer exists";

/// `<config>-<version>`
pub fn rollout_name_for_version(config_name: &str, version: i64) -> String {
    format!("{config_name}-{version}")
}

pub fn latest_rollout_name(config: &DeploymentConfig) -> String {
    rollout_name_for_version(config.name(), config.status.latest_version)
}

pub fn deployer_pod_name(rollout_name: &str) -> String {
    format!("deploy-{rollout_name}")
}

/// Selects every worker and hook pod of a rollout.
pub fn deployer_pod_selector(rollout_name: &str) -> Selector {
    Selector::from([(
        DEPLOYER_POD_FOR_DEPLOYMENT_LABEL.to_string(),
        rollout_name.to_string(),
    )])
}

/// Selects every rollout of a config.
pub fn config_selector(config_name: &str) -> Selector {
    Selector::from([(CONFIG_LABEL.to_string(), config_name.to_string())])
}

/// Status recorded on the rollout; missing or unknown reads as New.
pub fn status_for(rollout: &Rollout) -> RolloutStatus {
    rollout
        .annotation(STATUS_ANNOTATION)
        .and_then(|status| status.parse().ok())
        .unwrap_or(RolloutStatus::New)
}

pub fn is_cancelled(rollout: &Rollout) -> bool {
    rollout.annotation(CANCELLED_ANNOTATION) == Some(CANCELLED_ANNOTATION_VALUE)
}

pub fn is_terminal(rollout: &Rollout) -> bool {
    status_for(rollout).is_terminal()
}

pub fn version_for(rollout: &Rollout) -> Option<i64> {
    rollout
        .annotation(VERSION_ANNOTATION)
        .and_then(|version| version.parse().ok())
}

pub fn config_name_for(rollout: &Rollout) -> Option<&str> {
    rollout.annotation(CONFIG_ANNOTATION)
}

/// The rollout a worker or hook pod belongs to.
pub fn rollout_name_for_pod(pod: &Pod) -> Option<&str> {
    pod.annotation(DEPLOYMENT_ANNOTATION)
        .or_else(|| pod.label(DEPLOYER_POD_FOR_DEPLOYMENT_LABEL))
}

pub fn replicas_for(rollout: &Rollout) -> i32 {
    rollout
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or_default()
}

pub fn set_replicas(rollout: &mut Rollout, replicas: i32) {
    rollout.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
}

/// Reconstructs the config snapshot a rollout was created from.
pub fn decode_config(
    rollout: &Rollout,
    codec: &dyn ConfigCodec,
) -> Result<DeploymentConfig, DecodeError> {
    let encoded = rollout
        .annotation(ENCODED_CONFIG_ANNOTATION)
        .ok_or_else(|| DecodeError::MissingAnnotation(rollout.name().to_string()))?;
    Ok(codec.decode(encoded)?)
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("rollout {0} has no encoded config annotation")]
    MissingAnnotation(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Builds the rollout for the config's latest version. The rollout starts
/// with zero replicas; the worker pod scales it up.
pub fn make_rollout(
    config: &DeploymentConfig,
    codec: &dyn ConfigCodec,
) -> Result<Rollout, CodecError> {
    let encoded = codec.encode(config)?;
    let name = latest_rollout_name(config);
    let version = config.status.latest_version.to_string();

    let mut template = config.spec.template.clone().unwrap_or_default();
    if let Some(spec) = template.spec.as_mut() {
        for container in spec.containers.iter_mut() {
            if let Some(image) = container.image.as_mut() {
                *image = image.trim().to_string();
            }
        }
    }
    label_template(&mut template, config.name(), &name, &version);

    let mut labels = config.meta().labels.clone().unwrap_or_default();
    labels.insert(CONFIG_LABEL.to_string(), config.name().to_string());

    let mut selector = config.spec.selector.clone();
    selector.insert(CONFIG_LABEL.to_string(), config.name().to_string());
    selector.insert(DEPLOYMENT_LABEL.to_string(), name.clone());

    let mut annotations = BTreeMap::from([
        (CONFIG_ANNOTATION.to_string(), config.name().to_string()),
        (ENCODED_CONFIG_ANNOTATION.to_string(), encoded),
        (STATUS_ANNOTATION.to_string(), RolloutStatus::New.to_string()),
        (VERSION_ANNOTATION.to_string(), version),
        (
            DESIRED_REPLICAS_ANNOTATION.to_string(),
            config.spec.replicas.to_string(),
        ),
    ]);
    if let Some(details) = &config.status.details {
        let reason = if !details.message.is_empty() {
            Some(details.message.clone())
        } else {
            details.causes.first().map(|cause| cause.message().to_string())
        };
        if let Some(reason) = reason {
            annotations.insert(STATUS_REASON_ANNOTATION.to_string(), reason);
        }
    }

    Ok(Rollout {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(config.namespace().to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: owner_reference(config).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(ReplicationControllerSpec {
            replicas: Some(0),
            selector: Some(selector),
            min_ready_seconds: Some(config.spec.min_ready_seconds),
            template: Some(template),
        }),
        status: None,
    })
}

fn label_template(template: &mut PodTemplateSpec, config_name: &str, rollout: &str, version: &str) {
    let meta = template.metadata.get_or_insert_with(Default::default);
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(CONFIG_LABEL.to_string(), config_name.to_string());
    labels.insert(DEPLOYMENT_LABEL.to_string(), rollout.to_string());

    set_annotation(meta, DEPLOYMENT_ANNOTATION, rollout);
    set_annotation(meta, CONFIG_ANNOTATION, config_name);
    set_annotation(meta, VERSION_ANNOTATION, version);
}

fn owner_reference(config: &DeploymentConfig) -> Option<OwnerReference> {
    let uid = config.meta().uid.clone()?;
    Some(OwnerReference {
        api_version: "apps.krollout.io/v1".to_string(),
        kind: DeploymentConfig::KIND.to_string(),
        name: config.name().to_string(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// `namespace/name (version)` used in log lines and events.
pub fn label_for_rollout(rollout: &Rollout) -> String {
    match version_for(rollout) {
        Some(version) => format!("{}/{} ({version})", rollout.namespace(), rollout.name()),
        None => format!("{}/{}", rollout.namespace(), rollout.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::models::DeploymentCause;
    use crate::testutil::ok_config;

    #[test]
    fn make_rollout_snapshots_the_config() {
        let mut config = ok_config("app", 3);
        config.status.details = Some(crate::models::DeploymentDetails {
            message: String::new(),
            causes: vec![DeploymentCause::ConfigChange],
        });

        let rollout = make_rollout(&config, &JsonCodec).unwrap();

        assert_eq!(rollout.name(), "app-3");
        assert_eq!(status_for(&rollout), RolloutStatus::New);
        assert_eq!(version_for(&rollout), Some(3));
        assert_eq!(config_name_for(&rollout), Some("app"));
        assert_eq!(replicas_for(&rollout), 0);
        assert_eq!(rollout.annotation(STATUS_REASON_ANNOTATION), Some("config change"));
        assert_eq!(rollout.label(CONFIG_LABEL), Some("app"));

        let decoded = decode_config(&rollout, &JsonCodec).unwrap();
        assert_eq!(decoded, config);

        let selector = rollout.spec.as_ref().unwrap().selector.clone().unwrap();
        assert_eq!(selector.get(DEPLOYMENT_LABEL).map(String::as_str), Some("app-3"));
        let template_labels = rollout
            .spec
            .as_ref()
            .and_then(|spec| spec.template.as_ref())
            .and_then(|template| template.metadata.as_ref())
            .and_then(|meta| meta.labels.clone())
            .unwrap();
        assert_eq!(template_labels.get(DEPLOYMENT_LABEL).map(String::as_str), Some("app-3"));
    }

    #[test]
    fn missing_status_annotation_reads_as_new() {
        assert_eq!(status_for(&Rollout::default()), RolloutStatus::New);
        assert!(!is_cancelled(&Rollout::default()));
    }

    #[test]
    fn decode_requires_the_encoded_annotation() {
        let err = decode_config(&Rollout::default(), &JsonCodec).unwrap_err();
        assert!(matches!(err, DecodeError::MissingAnnotation(_)));
    }
}
