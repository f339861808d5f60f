//! Rollback candidates: the current config with selected parts taken from a
//! historical one.

use std::sync::Arc;

use tracing::info;

use crate::codec::ConfigCodec;
use crate::deployutil::{decode_config, rollout_name_for_version};
use crate::error::ApiError;
use crate::models::{
    DeploymentConfig, DeploymentConfigRollback, DeploymentTrigger, Object, Rollout, RollbackSpec,
};
use crate::storage::{Clients, ObjectClient};

/// Builds a rollback candidate from `from` (the current config) and `to`
/// (the config being rolled back to). Image change triggers of the result
/// never fire on their own, so the rollback is not immediately overridden
/// by the next image push.
pub fn generate_rollback(
    from: &DeploymentConfig,
    to: &DeploymentConfig,
    spec: &RollbackSpec,
) -> DeploymentConfig {
    let mut rollback = from.clone();

    if spec.include_triggers {
        rollback.spec.triggers = to.spec.triggers.clone();
    }
    if spec.include_template {
        rollback.spec.template = to.spec.template.clone();
    }
    if spec.include_replication_meta {
        rollback.spec.replicas = to.spec.replicas;
        rollback.spec.selector = to.spec.selector.clone();
    }
    if spec.include_strategy {
        rollback.spec.strategy = to.spec.strategy.clone();
    }

    for trigger in rollback.spec.triggers.iter_mut() {
        if let DeploymentTrigger::ImageChange { params } = trigger {
            params.automatic = false;
        }
    }

    rollback.status.latest_version += 1;
    rollback
}

/// Validates rollback requests and loads the historical config.
pub struct RollbackService {
    configs: Arc<dyn ObjectClient<DeploymentConfig>>,
    rollouts: Arc<dyn ObjectClient<Rollout>>,
    codec: Arc<dyn ConfigCodec>,
}

impl RollbackService {
    pub fn new(clients: &Clients, codec: Arc<dyn ConfigCodec>) -> Self {
        Self {
            configs: clients.configs.clone(),
            rollouts: clients.rollouts.clone(),
            codec,
        }
    }

    /// Returns the candidate without persisting it.
    pub async fn rollback(
        &self,
        namespace: &str,
        request: &DeploymentConfigRollback,
    ) -> Result<DeploymentConfig, ApiError> {
        if request.name.is_empty() {
            return Err(ApiError::Invalid("name is required".to_string()));
        }
        if request.revision < 0 {
            return Err(ApiError::Invalid("revision must not be negative".to_string()));
        }

        let config = self.configs.get(namespace, &request.name).await?;
        let latest = config.status.latest_version;
        match latest {
            0 => {
                return Err(ApiError::BadRequest(
                    "cannot rollback an undeployed config".to_string(),
                ))
            }
            1 => {
                return Err(ApiError::BadRequest(format!(
                    "no previous deployment exists for {}/{}",
                    namespace, request.name
                )))
            }
            _ => {}
        }

        let revision = if request.revision == 0 {
            latest - 1
        } else {
            request.revision
        };
        if revision == latest {
            return Err(ApiError::BadRequest(format!(
                "version {revision} is already the latest"
            )));
        }

        let name = rollout_name_for_version(&request.name, revision);
        let rollout = self.rollouts.get(namespace, &name).await.map_err(|e| {
            if e.is_not_found() {
                ApiError::NotFound(format!("rollout {namespace}/{name} not found"))
            } else {
                e.into()
            }
        })?;
        let target = decode_config(&rollout, self.codec.as_ref()).map_err(|e| {
            ApiError::Internal(format!("couldn't decode the config of rollout {namespace}/{name}: {e}"))
        })?;

        let candidate = generate_rollback(&config, &target, &request.spec);
        info!(
            config = %config.key(),
            from = latest,
            to = revision,
            "generated rollback"
        );
        Ok(candidate)
    }
}
