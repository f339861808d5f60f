//! Cancelling the latest rollout of a config.

use tracing::info;

use crate::deployutil::{
    is_cancelled, latest_rollout_name, status_for, CANCELLED_ANNOTATION,
    CANCELLED_ANNOTATION_VALUE, REASON_CANCELLED_BY_USER, STATUS_REASON_ANNOTATION,
};
use crate::error::ApiError;
use crate::models::{set_annotation, DeploymentConfig, Object, Rollout};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::storage::ObjectClient;

/// Marks the latest rollout of `name` cancelled. The deployer controller
/// notices the annotation and tears the rollout down.
pub async fn cancel_latest(
    configs: &dyn ObjectClient<DeploymentConfig>,
    rollouts: &dyn ObjectClient<Rollout>,
    namespace: &str,
    name: &str,
) -> Result<Rollout, ApiError> {
    let config = configs.get(namespace, name).await?;
    if config.status.latest_version == 0 {
        return Err(ApiError::BadRequest(format!(
            "{namespace}/{name} has never been deployed"
        )));
    }
    let rollout_name = latest_rollout_name(&config);

    retry_with_backoff(
        &RetryConfig::default(),
        "cancel rollout",
        ApiError::is_conflict,
        || {
            let rollout_name = rollout_name.as_str();
            async move {
                let mut rollout = rollouts.get(namespace, rollout_name).await?;
                let status = status_for(&rollout);
                if status.is_terminal() {
                    return Err(ApiError::BadRequest(format!(
                        "rollout {namespace}/{rollout_name} is already {status}"
                    )));
                }
                if is_cancelled(&rollout) {
                    return Ok(rollout);
                }

                set_annotation(&mut rollout.metadata, CANCELLED_ANNOTATION, CANCELLED_ANNOTATION_VALUE);
                set_annotation(&mut rollout.metadata, STATUS_REASON_ANNOTATION, REASON_CANCELLED_BY_USER);
                let updated = rollouts.update(&rollout).await?;
                info!(rollout = %updated.key(), "cancelled");
                Ok(updated)
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RolloutStatus;
    use crate::storage::MemoryBackend;
    use crate::testutil::{ok_config, ok_rollout, with_status};

    #[tokio::test]
    async fn marks_in_flight_rollout_cancelled() {
        let backend = MemoryBackend::recording();
        let config = backend.configs.seed(ok_config("app", 2));
        backend
            .rollouts
            .seed(with_status(ok_rollout(&config), RolloutStatus::Running));

        let cancelled = cancel_latest(backend.configs.as_ref(), backend.rollouts.as_ref(), "test", "app")
            .await
            .unwrap();

        assert!(is_cancelled(&cancelled));
        assert_eq!(cancelled.annotation(STATUS_REASON_ANNOTATION), Some(REASON_CANCELLED_BY_USER));
        assert_eq!(status_for(&cancelled), RolloutStatus::Running);
    }

    #[tokio::test]
    async fn terminal_rollouts_cannot_be_cancelled() {
        let backend = MemoryBackend::recording();
        let config = backend.configs.seed(ok_config("app", 2));
        backend
            .rollouts
            .seed(with_status(ok_rollout(&config), RolloutStatus::Complete));

        let err = cancel_latest(backend.configs.as_ref(), backend.rollouts.as_ref(), "test", "app")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(backend.rollouts.mutations().is_empty());
    }
}
