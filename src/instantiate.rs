//! The instantiate operation: bump a config's latest version when one of its
//! triggers fired.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::codec::ConfigCodec;
use crate::error::ApiError;
use crate::images::ImageResolver;
use crate::models::{DeploymentConfig, DeploymentDetails, DeploymentRequest, Object, Rollout};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::storage::{Clients, ObjectClient};
use crate::triggers::{can_trigger, process_triggers};

#[async_trait]
pub trait Instantiate: Send + Sync {
    /// Returns the updated config, or `NoContent` when nothing changed.
    async fn instantiate(
        &self,
        namespace: &str,
        request: &DeploymentRequest,
    ) -> Result<DeploymentConfig, ApiError>;
}

pub struct Instantiator {
    configs: Arc<dyn ObjectClient<DeploymentConfig>>,
    rollouts: Arc<dyn ObjectClient<Rollout>>,
    images: Arc<dyn ImageResolver>,
    codec: Arc<dyn ConfigCodec>,
    retry: RetryConfig,
}

impl Instantiator {
    pub fn new(clients: &Clients, images: Arc<dyn ImageResolver>, codec: Arc<dyn ConfigCodec>) -> Self {
        Self {
            configs: clients.configs.clone(),
            rollouts: clients.rollouts.clone(),
            images,
            codec,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn validate(request: &DeploymentRequest) -> Result<(), ApiError> {
        if request.name.is_empty() {
            return Err(ApiError::Invalid("name is required".to_string()));
        }
        if !request.latest && !request.exclude_triggers.is_empty() {
            return Err(ApiError::Invalid(
                "excludeTriggers only applies when latest is set".to_string(),
            ));
        }
        Ok(())
    }

    async fn process_request(
        &self,
        mut config: DeploymentConfig,
        request: &DeploymentRequest,
    ) -> Result<DeploymentConfig, ApiError> {
        if request.latest {
            process_triggers(
                &mut config,
                self.images.as_ref(),
                request.force,
                &request.exclude_triggers,
            )
            .await?;
        }

        let (should_instantiate, causes) =
            can_trigger(&config, self.rollouts.as_ref(), self.codec.as_ref(), request.force).await?;
        if !should_instantiate {
            return Err(ApiError::NoContent("DeploymentConfig not changed".to_string()));
        }

        let message = causes
            .first()
            .map(|cause| cause.message().to_string())
            .unwrap_or_default();
        config.status.details = Some(DeploymentDetails { message, causes });
        config.status.latest_version += 1;

        let updated = self.configs.update(&config).await?;
        info!(
            config = %updated.key(),
            version = updated.status.latest_version,
            "instantiated"
        );
        Ok(updated)
    }
}

#[async_trait]
impl Instantiate for Instantiator {
    async fn instantiate(
        &self,
        namespace: &str,
        request: &DeploymentRequest,
    ) -> Result<DeploymentConfig, ApiError> {
        Self::validate(request)?;

        retry_with_backoff(&self.retry, "instantiate", ApiError::is_conflict, || async move {
            let config = self.configs.get(namespace, &request.name).await?;
            self.process_request(config, request).await
        })
        .await
    }
}
