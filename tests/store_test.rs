use std::collections::BTreeMap;

use futures::StreamExt;
use krollout::models::{DeploymentConfig, ImageStream, Object, Selector};
use krollout::storage::{ObjectClient, WatchEvent};
use krollout::Storage;
use serde_json::json;

fn config(name: &str, app: &str) -> DeploymentConfig {
    serde_json::from_value(json!({
        "metadata": {
            "name": name,
            "namespace": "prod",
            "labels": { "app": app }
        },
        "spec": {
            "triggers": [{ "type": "ConfigChange" }],
            "replicas": 1,
            "template": {
                "spec": { "containers": [{ "name": "web", "image": "registry.local/web:1" }] }
            }
        }
    }))
    .unwrap()
}

async fn open(path: &std::path::Path) -> Storage {
    let storage = Storage::new(&format!("sqlite://{}?mode=rwc", path.display()))
        .await
        .unwrap();
    storage.migrate().await.unwrap();
    storage
}

#[tokio::test]
async fn test_objects_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("krollout.db");

    {
        let storage = open(&path).await;
        let configs = storage.configs();
        let created = configs.create(&config("web", "web")).await.unwrap();
        let mut edited = created.clone();
        edited.status.latest_version = 4;
        configs.update(&edited).await.unwrap();
        storage.pool.close().await;
    }

    let storage = open(&path).await;
    let stored = storage.configs().get("prod", "web").await.unwrap();
    assert_eq!(stored.status.latest_version, 4);
    assert_eq!(stored.resource_version(), Some("2"));
    assert_eq!(stored.meta().generation, Some(2));
    assert!(stored.meta().uid.is_some());
}

#[tokio::test]
async fn test_list_filters_namespace_and_labels() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open(&dir.path().join("list.db")).await;
    let configs = storage.configs();

    configs.create(&config("web", "web")).await.unwrap();
    configs.create(&config("worker", "batch")).await.unwrap();
    let mut elsewhere = config("web", "web");
    elsewhere.metadata.namespace = Some("staging".to_string());
    configs.create(&elsewhere).await.unwrap();

    assert_eq!(configs.list(None, &Selector::new()).await.unwrap().len(), 3);
    assert_eq!(configs.list(Some("prod"), &Selector::new()).await.unwrap().len(), 2);

    let selector: Selector = BTreeMap::from([("app".to_string(), "batch".to_string())]);
    let batch = configs.list(Some("prod"), &selector).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].name(), "worker");
}

#[tokio::test]
async fn test_watch_is_scoped_to_one_kind() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open(&dir.path().join("watch.db"))
        .await
        .with_poll_interval(std::time::Duration::from_millis(10));
    let configs = storage.configs();
    let streams = storage.image_streams();

    let mut events = configs.watch().await.unwrap();
    assert!(matches!(events.next().await, Some(Ok(WatchEvent::Synced))));

    let stream: ImageStream = serde_json::from_value(json!({
        "metadata": { "name": "web", "namespace": "prod" }
    }))
    .unwrap();
    streams.create(&stream).await.unwrap();
    let created = configs.create(&config("web", "web")).await.unwrap();
    let mut edited = created.clone();
    edited.spec.replicas = 3;
    configs.update(&edited).await.unwrap();

    match events.next().await {
        Some(Ok(WatchEvent::Added(added))) => assert_eq!(added.name(), "web"),
        other => panic!("unexpected event {other:?}"),
    }
    match events.next().await {
        Some(Ok(WatchEvent::Modified(modified))) => assert_eq!(modified.spec.replicas, 3),
        other => panic!("unexpected event {other:?}"),
    }
}
