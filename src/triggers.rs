//! Deciding whether a config warrants a new rollout, and why.

use std::borrow::Cow;

use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use tracing::debug;

use crate::codec::ConfigCodec;
use crate::deployutil::{decode_config, latest_rollout_name};
use crate::error::ApiError;
use crate::images::ImageResolver;
use crate::models::image_stream::split_image_stream_tag;
use crate::models::{
    CauseImageTrigger, DeploymentCause, DeploymentConfig, DeploymentConfigSpec,
    DeploymentTrigger, ImageChangeParams, Object, Rollout, TriggerType,
};
use crate::storage::ObjectClient;

/// Resolves every eligible image change trigger to the latest image of its
/// tag and patches the named containers. A trigger is eligible unless its
/// type is excluded, and only fires on its own when it is automatic and the
/// config is not paused; `force` overrides both.
///
/// Missing streams or tags are skipped. Any other lookup failure is
/// collected, and all of them are reported together once every trigger has
/// been tried.
pub async fn process_triggers(
    config: &mut DeploymentConfig,
    resolver: &dyn ImageResolver,
    force: bool,
    exclude: &[TriggerType],
) -> Result<(), ApiError> {
    if exclude.contains(&TriggerType::ImageChange) {
        return Ok(());
    }

    let namespace = config.namespace().to_string();
    let DeploymentConfigSpec {
        triggers,
        template,
        paused,
        ..
    } = &mut config.spec;

    let mut failures = Vec::new();
    for trigger in triggers.iter_mut() {
        let DeploymentTrigger::ImageChange { params } = trigger else {
            continue;
        };
        if !force && (*paused || !params.automatic) {
            continue;
        }

        let Some((stream, tag)) = split_image_stream_tag(&params.from.name) else {
            debug!(from = %params.from.name, "image change trigger has no tag, skipping");
            continue;
        };
        let stream_namespace = params.from.namespace_or(&namespace);

        let image = match resolver.resolve(stream_namespace, stream, tag).await {
            Ok(Some(image)) => image,
            Ok(None) => {
                debug!(stream = %params.from.name, "tag has no image yet");
                continue;
            }
            Err(e) if e.is_not_found() => {
                debug!(stream = %params.from.name, "image stream not found");
                continue;
            }
            Err(e) => {
                failures.push(format!("{stream_namespace}/{}: {e}", params.from.name));
                continue;
            }
        };

        if image == params.last_triggered_image {
            continue;
        }

        if let Some(template) = template.as_mut() {
            update_containers(template, &params.container_names, &image);
        }
        params.last_triggered_image = image;
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Internal(format!(
            "couldn't resolve image triggers: {}",
            failures.join("; ")
        )))
    }
}

fn update_containers(template: &mut PodTemplateSpec, names: &[String], image: &str) {
    let Some(spec) = template.spec.as_mut() else {
        return;
    };
    let init = spec.init_containers.iter_mut().flatten();
    for container in spec.containers.iter_mut().chain(init) {
        if names.iter().any(|name| name == &container.name) {
            set_image(container, image);
        }
    }
}

fn set_image(container: &mut Container, image: &str) {
    container.image = Some(image.to_string());
}

/// Loads the previous generation of `config` and decides whether it should
/// be instantiated.
pub async fn can_trigger(
    config: &DeploymentConfig,
    rollouts: &dyn ObjectClient<Rollout>,
    codec: &dyn ConfigCodec,
    force: bool,
) -> Result<(bool, Vec<DeploymentCause>), ApiError> {
    if force {
        return Ok((true, vec![DeploymentCause::Manual]));
    }

    let previous = previous_generation(config, rollouts, codec).await?;
    decide(config, &previous, force)
}

/// The config as it was when its latest rollout was created.
async fn previous_generation<'a>(
    config: &'a DeploymentConfig,
    rollouts: &dyn ObjectClient<Rollout>,
    codec: &dyn ConfigCodec,
) -> Result<Cow<'a, DeploymentConfig>, ApiError> {
    if config.status.latest_version == 0 {
        return Ok(Cow::Borrowed(config));
    }

    let name = latest_rollout_name(config);
    let rollout = rollouts.get(config.namespace(), &name).await?;
    let decoded = decode_config(&rollout, codec).map_err(|e| {
        ApiError::Internal(format!(
            "couldn't decode the config of rollout {}/{name}: {e}",
            config.namespace()
        ))
    })?;
    Ok(Cow::Owned(decoded))
}

/// Compares `config` against its `previous` generation.
pub fn decide(
    config: &DeploymentConfig,
    previous: &DeploymentConfig,
    force: bool,
) -> Result<(bool, Vec<DeploymentCause>), ApiError> {
    if force {
        return Ok((true, vec![DeploymentCause::Manual]));
    }

    let mut causes = Vec::new();
    let mut unresolved = 0usize;

    for params in config.image_change_params() {
        if params.last_triggered_image.is_empty() {
            unresolved += 1;
            continue;
        }
        if !params.automatic {
            continue;
        }
        if config.status.latest_version > 0 && !triggered_since(params, previous) {
            continue;
        }
        causes.push(DeploymentCause::ImageChange {
            image_trigger: CauseImageTrigger {
                from: params.from.clone(),
            },
        });
    }

    if unresolved > 0 {
        return Err(ApiError::BadRequest(format!(
            "cannot trigger a deployment for {:?} because it contains unresolved images",
            config.name()
        )));
    }

    if causes.is_empty()
        && config.has_config_change_trigger()
        && (config.status.latest_version == 0 || config.spec.template != previous.spec.template)
    {
        causes.push(DeploymentCause::ConfigChange);
    }

    Ok((!causes.is_empty(), causes))
}

/// Whether `params` is new since `previous` or resolved to a different image
/// than the same trigger there.
fn triggered_since(params: &ImageChangeParams, previous: &DeploymentConfig) -> bool {
    match previous
        .image_change_params()
        .find(|old| old.from == params.from)
    {
        Some(old) => old.last_triggered_image != params.last_triggered_image,
        None => true,
    }
}
