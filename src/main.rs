use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use krollout::{
    api::{start_server, AppState},
    codec::{ConfigCodec, JsonCodec},
    config::{Settings, StorageBackend},
    controllers::ControllerManager,
    events::{EventRecorder, MemoryRecorder, SqliteRecorder},
    images::StreamResolver,
    instantiate::{Instantiate, Instantiator},
    rollback::RollbackService,
    storage::MemoryBackend,
    Storage,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "krollout=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var_os("KROLLOUT_CONFIG")
        .map(PathBuf::from)
        .or_else(|| std::env::args_os().nth(1).map(PathBuf::from));
    let settings = Settings::load(config_path.as_deref())?;

    tracing::info!("Starting krollout");

    let (clients, storage, recorder) = match settings.storage.backend {
        StorageBackend::Sqlite => {
            let storage = Storage::new(&settings.storage.database_url)
                .await?
                .with_poll_interval(Duration::from_millis(settings.storage.poll_interval_ms));

            tracing::info!("Running database migrations");
            storage.migrate().await?;

            let recorder: Arc<dyn EventRecorder> =
                Arc::new(SqliteRecorder::new((*storage.pool).clone()));
            (storage.clients(), Some(storage), recorder)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; state is lost on exit");
            let recorder: Arc<dyn EventRecorder> = Arc::new(MemoryRecorder::new());
            (MemoryBackend::new().clients(), None, recorder)
        }
    };

    let codec: Arc<dyn ConfigCodec> = Arc::new(JsonCodec);
    let resolver = Arc::new(StreamResolver::new(clients.image_streams.clone()));
    let instantiator: Arc<dyn Instantiate> =
        Arc::new(Instantiator::new(&clients, resolver, codec.clone()));

    let manager = ControllerManager::new(
        clients.clone(),
        settings.clone(),
        codec.clone(),
        recorder.clone(),
        instantiator.clone(),
    );
    let controllers = manager.start().await;

    let state = AppState {
        rollback: Arc::new(RollbackService::new(&clients, codec)),
        clients,
        instantiator,
        recorder,
        storage,
    };

    tokio::select! {
        result = start_server(state, &settings.listen_addr) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    controllers.shutdown().await;

    Ok(())
}
