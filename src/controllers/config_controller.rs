//! Turns each new config version into a rollout, cancels what it supersedes
//! and keeps the config status in line with its rollouts.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cache::{EventHandler, Lister};
use crate::codec::ConfigCodec;
use crate::deployutil::{
    config_name_for, config_selector, is_cancelled, is_terminal, latest_rollout_name,
    make_rollout, replicas_for, set_replicas, status_for, version_for, CANCELLED_ANNOTATION,
    CANCELLED_ANNOTATION_VALUE, REASON_NEWER_DEPLOYMENT_EXISTS, STATUS_REASON_ANNOTATION,
};
use crate::error::{ReconcileError, StoreError};
use crate::events::{emit, EventRecorder, EventType};
use crate::models::{set_annotation, DeploymentConfig, Object, ObjectKey, Rollout, RolloutStatus};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::storage::ObjectClient;
use crate::workqueue::WorkQueue;

pub const DEFAULT_MAX_RETRIES: u32 = 15;

pub struct ConfigController {
    configs: Arc<dyn ObjectClient<DeploymentConfig>>,
    rollouts: Arc<dyn ObjectClient<Rollout>>,
    config_lister: Arc<dyn Lister<DeploymentConfig>>,
    rollout_lister: Arc<dyn Lister<Rollout>>,
    codec: Arc<dyn ConfigCodec>,
    recorder: Arc<dyn EventRecorder>,
    queue: WorkQueue<ObjectKey>,
    max_retries: u32,
}

impl ConfigController {
    pub fn new(
        configs: Arc<dyn ObjectClient<DeploymentConfig>>,
        rollouts: Arc<dyn ObjectClient<Rollout>>,
        config_lister: Arc<dyn Lister<DeploymentConfig>>,
        rollout_lister: Arc<dyn Lister<Rollout>>,
        codec: Arc<dyn ConfigCodec>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            configs,
            rollouts,
            config_lister,
            rollout_lister,
            codec,
            recorder,
            queue: WorkQueue::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    pub fn config_handler(&self) -> Arc<dyn EventHandler<DeploymentConfig>> {
        Arc::new(ConfigEvents {
            queue: self.queue.clone(),
        })
    }

    pub fn rollout_handler(&self) -> Arc<dyn EventHandler<Rollout>> {
        Arc::new(RolloutEvents {
            queue: self.queue.clone(),
        })
    }

    pub async fn run(self: Arc<Self>, workers: usize) {
        info!(workers, "starting config controller");
        let handles: Vec<_> = (0..workers.max(1))
            .map(|_| {
                let controller = self.clone();
                tokio::spawn(async move { while controller.process_next_work_item().await {} })
            })
            .collect();
        futures::future::join_all(handles).await;
        info!("config controller stopped");
    }

    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let config = self.config_lister.get(&key.namespace, &key.name);
        let result = match &config {
            Some(config) => self.handle(config).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => self.queue.forget(&key),
            Err(ReconcileError::Fatal(message)) => {
                error!(config = %key, "{message}");
                self.queue.forget(&key);
            }
            Err(ReconcileError::Actionable(message)) => {
                if let Some(config) = &config {
                    emit(self.recorder.as_ref(), config, EventType::Warning, "FailedRetry", message.clone()).await;
                }
                warn!(config = %key, "{message}");
                self.queue.forget(&key);
            }
            Err(err) if self.queue.num_requeues(&key) < self.max_retries => {
                debug!(config = %key, error = %err, "requeueing config");
                self.queue.add_rate_limited(key.clone());
            }
            Err(err) => {
                error!(config = %key, error = %err, "dropping config out of the queue");
                self.queue.forget(&key);
            }
        }
        self.queue.done(&key);
        true
    }

    pub async fn handle(&self, config: &DeploymentConfig) -> Result<(), ReconcileError> {
        if config.status.latest_version == 0 {
            return self.update_status(config, &[]).await;
        }

        let mut existing = self
            .rollout_lister
            .list(Some(config.namespace()), &config_selector(config.name()));
        if config.spec.paused {
            return self.update_status(config, &existing).await;
        }

        let latest_name = latest_rollout_name(config);
        let latest = existing.iter().find(|rollout| rollout.name() == latest_name).cloned();

        match latest {
            None => {
                let mut in_flight = false;
                for rollout in existing.iter().filter(|rollout| is_older(rollout, config)) {
                    if is_terminal(rollout) {
                        continue;
                    }
                    in_flight = true;
                    if !is_cancelled(rollout) {
                        self.cancel_superseded(rollout).await?;
                    }
                }
                if in_flight {
                    return Err(ReconcileError::transient(format!(
                        "older rollouts of {} are still running",
                        config.key()
                    )));
                }

                let rollout = make_rollout(config, self.codec.as_ref()).map_err(|e| {
                    ReconcileError::fatal(format!("couldn't make rollout for {}: {e}", config.key()))
                })?;
                match self.rollouts.create(&rollout).await {
                    Ok(created) => {
                        emit(
                            self.recorder.as_ref(),
                            config,
                            EventType::Normal,
                            "DeploymentCreated",
                            format!(
                                "Created new rollout {:?} for version {}",
                                created.name(),
                                config.status.latest_version
                            ),
                        )
                        .await;
                        existing.push(created);
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!(rollout = %rollout.key(), "rollout already created");
                    }
                    Err(e) => {
                        emit(
                            self.recorder.as_ref(),
                            config,
                            EventType::Warning,
                            "DeploymentCreationFailed",
                            format!("Couldn't deploy version {}: {e}", config.status.latest_version),
                        )
                        .await;
                        return Err(ReconcileError::transient(format!(
                            "couldn't create rollout for {}: {e}",
                            config.key()
                        )));
                    }
                }
            }
            Some(latest) if status_for(&latest) == RolloutStatus::Complete => {
                for rollout in existing.iter_mut() {
                    if !is_older(rollout, config) || replicas_for(rollout) == 0 {
                        continue;
                    }
                    let mut scaled = rollout.clone();
                    set_replicas(&mut scaled, 0);
                    *rollout = self.rollouts.update(&scaled).await?;
                    info!(rollout = %rollout.key(), "scaled down superseded rollout");
                }
            }
            Some(_) => {}
        }

        self.update_status(config, &existing).await
    }

    /// Marks `rollout` cancelled against the store's copy.
    async fn cancel_superseded(&self, rollout: &Rollout) -> Result<(), ReconcileError> {
        let cancelled = retry_with_backoff(
            &RetryConfig::default(),
            "cancel superseded rollout",
            StoreError::is_conflict,
            || async move {
                let mut current = self.rollouts.get(rollout.namespace(), rollout.name()).await?;
                if is_cancelled(&current) || is_terminal(&current) {
                    return Ok(None);
                }
                set_annotation(&mut current.metadata, CANCELLED_ANNOTATION, CANCELLED_ANNOTATION_VALUE);
                set_annotation(
                    &mut current.metadata,
                    STATUS_REASON_ANNOTATION,
                    REASON_NEWER_DEPLOYMENT_EXISTS,
                );
                self.rollouts.update(&current).await.map(Some)
            },
        )
        .await?;

        if let Some(cancelled) = cancelled {
            info!(rollout = %cancelled.key(), "cancelled superseded rollout");
            emit(
                self.recorder.as_ref(),
                &cancelled,
                EventType::Normal,
                "DeploymentCancelled",
                "Cancelled in favour of a newer version",
            )
            .await;
        }
        Ok(())
    }

    async fn update_status(&self, config: &DeploymentConfig, rollouts: &[Rollout]) -> Result<(), ReconcileError> {
        let mut updated = config.clone();
        updated.status.observed_generation = config.meta().generation.unwrap_or_default();
        updated.status.replicas = rollouts.iter().map(replicas_for).sum();

        if updated.status == config.status {
            return Ok(());
        }
        self.configs.update(&updated).await?;
        debug!(
            config = %config.key(),
            observed_generation = updated.status.observed_generation,
            replicas = updated.status.replicas,
            "synced config status"
        );
        Ok(())
    }
}

fn is_older(rollout: &Rollout, config: &DeploymentConfig) -> bool {
    version_for(rollout).map_or(false, |version| version < config.status.latest_version)
}

struct ConfigEvents {
    queue: WorkQueue<ObjectKey>,
}

impl EventHandler<DeploymentConfig> for ConfigEvents {
    fn on_add(&self, config: &DeploymentConfig) {
        self.queue.add(config.key());
    }

    fn on_update(&self, _old: &DeploymentConfig, new: &DeploymentConfig) {
        self.queue.add(new.key());
    }

    fn on_delete(&self, _config: &DeploymentConfig) {}
}

struct RolloutEvents {
    queue: WorkQueue<ObjectKey>,
}

impl RolloutEvents {
    fn enqueue_owner(&self, rollout: &Rollout) {
        if let Some(config) = config_name_for(rollout) {
            self.queue.add(ObjectKey::new(rollout.namespace(), config));
        }
    }
}

impl EventHandler<Rollout> for RolloutEvents {
    fn on_add(&self, rollout: &Rollout) {
        self.enqueue_owner(rollout);
    }

    fn on_update(&self, _old: &Rollout, new: &Rollout) {
        self.enqueue_owner(new);
    }

    fn on_delete(&self, rollout: &Rollout) {
        self.enqueue_owner(rollout);
    }
}
