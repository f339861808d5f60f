// Common test utilities and helpers

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use krollout::{
    api::{router, AppState},
    codec::{ConfigCodec, JsonCodec},
    config::Settings,
    controllers::{ControllerManager, RunningControllers},
    events::{EventRecorder, SqliteRecorder},
    images::StreamResolver,
    instantiate::{Instantiate, Instantiator},
    rollback::RollbackService,
    Storage,
};
use serde_json::{json, Value};

pub const NAMESPACE: &str = "default";

pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub storage: Storage,
    controllers: Option<RunningControllers>,
}

impl TestServer {
    /// API server on an ephemeral port over a private in-memory database.
    pub async fn start() -> Self {
        Self::spawn(false).await
    }

    /// Same as [`TestServer::start`] with every controller running.
    pub async fn start_with_controllers() -> Self {
        Self::spawn(true).await
    }

    async fn spawn(with_controllers: bool) -> Self {
        let storage = Storage::in_memory()
            .await
            .expect("in-memory storage")
            .with_poll_interval(Duration::from_millis(20));
        let clients = storage.clients();
        let codec: Arc<dyn ConfigCodec> = Arc::new(JsonCodec);
        let recorder: Arc<dyn EventRecorder> = Arc::new(SqliteRecorder::new((*storage.pool).clone()));
        let resolver = Arc::new(StreamResolver::new(clients.image_streams.clone()));
        let instantiator: Arc<dyn Instantiate> =
            Arc::new(Instantiator::new(&clients, resolver, codec.clone()));

        let controllers = if with_controllers {
            let settings = Settings {
                resync_period_secs: 0,
                ..Default::default()
            };
            let manager = ControllerManager::new(
                clients.clone(),
                settings,
                codec.clone(),
                recorder.clone(),
                instantiator.clone(),
            );
            Some(manager.start().await)
        } else {
            None
        };

        let state = AppState {
            rollback: Arc::new(RollbackService::new(&clients, codec)),
            clients,
            instantiator,
            recorder,
            storage: Some(storage.clone()),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.expect("server");
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            storage,
            controllers,
        }
    }

    pub fn apps_url(&self, path: &str) -> String {
        format!(
            "{}/apis/apps.krollout.io/v1/namespaces/{NAMESPACE}/{path}",
            self.base_url
        )
    }

    pub fn core_url(&self, path: &str) -> String {
        format!("{}/api/v1/namespaces/{NAMESPACE}/{path}", self.base_url)
    }

    pub async fn get_json(&self, url: &str) -> Option<Value> {
        let resp = self.client.get(url).send().await.expect("request");
        if !resp.status().is_success() {
            return None;
        }
        Some(resp.json().await.expect("json body"))
    }

    pub async fn shutdown(mut self) {
        if let Some(controllers) = self.controllers.take() {
            controllers.shutdown().await;
        }
    }
}

/// Polls `check` until it yields a value or ten seconds pass.
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn config_json(name: &str, image: &str, triggers: Value) -> Value {
    json!({
        "metadata": {
            "name": name,
            "labels": { "app": name }
        },
        "spec": {
            "strategy": { "type": "Recreate" },
            "triggers": triggers,
            "replicas": 2,
            "selector": { "app": name },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": {
                    "containers": [{ "name": "web", "image": image }]
                }
            }
        }
    })
}

pub fn config_change() -> Value {
    json!([{ "type": "ConfigChange" }])
}

pub fn image_change(stream_tag: &str) -> Value {
    json!({
        "type": "ImageChange",
        "imageChangeParams": {
            "automatic": true,
            "containerNames": ["web"],
            "from": { "kind": "ImageStreamTag", "name": stream_tag }
        }
    })
}

pub fn image_stream_json(name: &str, tag: &str, reference: &str) -> Value {
    json!({
        "metadata": { "name": name },
        "status": {
            "tags": [{
                "tag": tag,
                "items": [{ "dockerImageReference": reference, "image": reference }]
            }]
        }
    })
}
