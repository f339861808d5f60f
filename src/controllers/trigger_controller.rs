//! Instantiates configs whose triggers may have fired: on config changes and
//! whenever an image stream gains a new tag.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{EventHandler, Lister};
use crate::error::ApiError;
use crate::images::configs_for_image_stream;
use crate::instantiate::Instantiate;
use crate::models::{DeploymentConfig, DeploymentRequest, ImageStream, Object, ObjectKey};
use crate::workqueue::WorkQueue;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub struct TriggerController {
    configs: Arc<dyn Lister<DeploymentConfig>>,
    instantiator: Arc<dyn Instantiate>,
    queue: WorkQueue<ObjectKey>,
    max_retries: u32,
}

impl TriggerController {
    pub fn new(configs: Arc<dyn Lister<DeploymentConfig>>, instantiator: Arc<dyn Instantiate>) -> Self {
        Self {
            configs,
            instantiator,
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

    pub fn image_stream_handler(&self) -> Arc<dyn EventHandler<ImageStream>> {
        Arc::new(ImageStreamEvents {
            queue: self.queue.clone(),
            configs: self.configs.clone(),
        })
    }

    pub async fn run(self: Arc<Self>, workers: usize) {
        info!(workers, "starting trigger controller");
        let handles: Vec<_> = (0..workers.max(1))
            .map(|_| {
                let controller = self.clone();
                tokio::spawn(async move { while controller.process_next_work_item().await {} })
            })
            .collect();
        futures::future::join_all(handles).await;
        info!("trigger controller stopped");
    }

    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = match self.configs.get(&key.namespace, &key.name) {
            Some(config) => self.handle(&config).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => self.queue.forget(&key),
            Err(err) if self.queue.num_requeues(&key) < self.max_retries => {
                warn!(config = %key, error = %err, "retrying config");
                self.queue.add_rate_limited(key.clone());
            }
            Err(err) => {
                warn!(config = %key, error = %err, "dropping config out of the trigger queue");
                self.queue.forget(&key);
            }
        }
        self.queue.done(&key);
        true
    }

    /// Asks for a new version of `config` when its triggers say so.
    pub async fn handle(&self, config: &DeploymentConfig) -> Result<(), ApiError> {
        if config.spec.triggers.is_empty() || config.spec.paused {
            return Ok(());
        }

        let request = DeploymentRequest {
            name: config.name().to_string(),
            latest: true,
            force: false,
            exclude_triggers: Vec::new(),
        };
        match self.instantiator.instantiate(config.namespace(), &request).await {
            Ok(updated) => {
                info!(
                    config = %updated.key(),
                    version = updated.status.latest_version,
                    "triggered new version"
                );
                Ok(())
            }
            Err(err) if err.is_no_content() => {
                debug!(config = %config.key(), "nothing to trigger");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

struct ConfigEvents {
    queue: WorkQueue<ObjectKey>,
}

impl EventHandler<DeploymentConfig> for ConfigEvents {
    fn on_add(&self, config: &DeploymentConfig) {
        self.queue.add(config.key());
    }

    fn on_update(&self, old: &DeploymentConfig, new: &DeploymentConfig) {
        // Resyncs redeliver the same version.
        if old.resource_version() == new.resource_version() {
            return;
        }
        if new.spec.paused || new.spec.triggers.is_empty() {
            return;
        }
        // The config controller has not seen this generation yet.
        if new.status.observed_generation < new.meta().generation.unwrap_or_default() {
            return;
        }
        self.queue.add(new.key());
    }

    fn on_delete(&self, _config: &DeploymentConfig) {}
}

struct ImageStreamEvents {
    queue: WorkQueue<ObjectKey>,
    configs: Arc<dyn Lister<DeploymentConfig>>,
}

impl ImageStreamEvents {
    fn enqueue_configs(&self, stream: &ImageStream) {
        for config in configs_for_image_stream(self.configs.as_ref(), stream) {
            self.queue.add(config.key());
        }
    }
}

impl EventHandler<ImageStream> for ImageStreamEvents {
    fn on_add(&self, stream: &ImageStream) {
        self.enqueue_configs(stream);
    }

    fn on_update(&self, old: &ImageStream, new: &ImageStream) {
        if old.status.tags != new.status.tags {
            self.enqueue_configs(new);
        }
    }

    fn on_delete(&self, _stream: &ImageStream) {}
}
