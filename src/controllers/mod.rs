pub mod config_controller;
pub mod deployer_controller;
pub mod trigger_controller;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::Informer;
use crate::codec::ConfigCodec;
use crate::config::Settings;
use crate::events::EventRecorder;
use crate::instantiate::Instantiate;
use crate::models::{Object, ObjectKey};
use crate::storage::{Clients, ObjectClient};
use crate::workqueue::WorkQueue;

pub use config_controller::ConfigController;
pub use deployer_controller::DeployerController;
pub use trigger_controller::TriggerController;

/// Builds the shared informers and runs every controller on top of them.
pub struct ControllerManager {
    clients: Clients,
    settings: Settings,
    codec: Arc<dyn ConfigCodec>,
    recorder: Arc<dyn EventRecorder>,
    instantiator: Arc<dyn Instantiate>,
}

/// Handle on running controllers.
pub struct RunningControllers {
    queues: Vec<WorkQueue<ObjectKey>>,
    informers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ControllerManager {
    pub fn new(
        clients: Clients,
        settings: Settings,
        codec: Arc<dyn ConfigCodec>,
        recorder: Arc<dyn EventRecorder>,
        instantiator: Arc<dyn Instantiate>,
    ) -> Self {
        Self {
            clients,
            settings,
            codec,
            recorder,
            instantiator,
        }
    }

    /// Starts the informers, waits for their caches to fill and then starts
    /// the controller workers.
    pub async fn start(&self) -> RunningControllers {
        let mut configs = self.informer(self.clients.configs.clone());
        let mut rollouts = self.informer(self.clients.rollouts.clone());
        let mut pods = self.informer(self.clients.pods.clone());
        let mut streams = self.informer(self.clients.image_streams.clone());

        let config_cache = configs.cache();
        let rollout_cache = rollouts.cache();
        let pod_cache = pods.cache();
        let stream_cache = streams.cache();

        let deployer = Arc::new(DeployerController::new(
            self.clients.rollouts.clone(),
            self.clients.pods.clone(),
            rollout_cache.clone(),
            pod_cache.clone(),
            self.codec.clone(),
            self.recorder.clone(),
            self.settings.deployer.clone(),
        ));
        let config_controller = Arc::new(
            ConfigController::new(
                self.clients.configs.clone(),
                self.clients.rollouts.clone(),
                config_cache.clone(),
                rollout_cache.clone(),
                self.codec.clone(),
                self.recorder.clone(),
            )
            .with_max_retries(self.settings.configs.max_retries),
        );
        let triggers = Arc::new(
            TriggerController::new(config_cache.clone(), self.instantiator.clone())
                .with_max_retries(self.settings.triggers.max_retries),
        );

        configs.add_handler(config_controller.config_handler());
        configs.add_handler(triggers.config_handler());
        rollouts.add_handler(config_controller.rollout_handler());
        rollouts.add_handler(deployer.rollout_handler());
        pods.add_handler(deployer.pod_handler());
        streams.add_handler(triggers.image_stream_handler());

        let informers = vec![
            tokio::spawn(configs.run()),
            tokio::spawn(rollouts.run()),
            tokio::spawn(pods.run()),
            tokio::spawn(streams.run()),
        ];

        config_cache.wait_for_sync().await;
        rollout_cache.wait_for_sync().await;
        pod_cache.wait_for_sync().await;
        stream_cache.wait_for_sync().await;
        info!("caches synced, starting controllers");

        let queues = vec![
            deployer.queue().clone(),
            config_controller.queue().clone(),
            triggers.queue().clone(),
        ];
        let workers = vec![
            tokio::spawn(deployer.run(self.settings.deployer.workers)),
            tokio::spawn(config_controller.run(self.settings.configs.workers)),
            tokio::spawn(triggers.run(self.settings.triggers.workers)),
        ];

        RunningControllers {
            queues,
            informers,
            workers,
        }
    }

    fn informer<T: Object>(&self, client: Arc<dyn ObjectClient<T>>) -> Informer<T> {
        let informer = Informer::new(client);
        match self.settings.resync_period() {
            Some(period) => informer.with_resync(period),
            None => informer,
        }
    }
}

impl RunningControllers {
    /// Lets in-flight work finish, then stops the informers.
    pub async fn shutdown(self) {
        for queue in &self.queues {
            queue.shut_down();
        }
        futures::future::join_all(self.workers).await;
        for informer in &self.informers {
            informer.abort();
        }
        info!("controllers stopped");
    }
}
