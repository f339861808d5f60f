mod common;

use common::{config_change, config_json, image_stream_json, TestServer};
use reqwest::StatusCode;
use serde_json::{json, Value};

const IMAGE: &str = "registry.local/app@sha256:0001";

#[tokio::test]
async fn test_health_endpoints() {
    let server = TestServer::start().await;

    let resp = server
        .client
        .get(format!("{}/livez", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server
        .client
        .get(format!("{}/readyz", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_deployment_config_crud() {
    let server = TestServer::start().await;
    let url = server.apps_url("deploymentconfigs");

    let resp = server
        .client
        .post(&url)
        .json(&config_json("frontend", IMAGE, config_change()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["metadata"]["namespace"], "default");
    assert_eq!(created["metadata"]["resourceVersion"], "1");
    assert_eq!(created["status"]["latestVersion"], 0);

    let resp = server
        .client
        .post(&url)
        .json(&config_json("frontend", IMAGE, config_change()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let list = server
        .get_json(&format!("{url}?labelSelector=app%3Dfrontend"))
        .await
        .unwrap();
    assert_eq!(list["kind"], "DeploymentConfigList");
    assert_eq!(list["items"].as_array().unwrap().len(), 1);

    let list = server
        .get_json(&format!("{url}?labelSelector=app%3Dbackend"))
        .await
        .unwrap();
    assert!(list["items"].as_array().unwrap().is_empty());

    let mut config = server.get_json(&format!("{url}/frontend")).await.unwrap();
    config["spec"]["replicas"] = json!(5);
    let resp = server
        .client
        .put(format!("{url}/frontend"))
        .json(&config)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let updated: Value = resp.json().await.unwrap();
    assert_eq!(updated["spec"]["replicas"], 5);
    assert_eq!(updated["metadata"]["generation"], 2);

    // The earlier copy is now stale.
    let resp = server
        .client
        .put(format!("{url}/frontend"))
        .json(&config)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["kind"], "Status");
    assert_eq!(status["code"], 409);

    let resp = server
        .client
        .delete(format!("{url}/frontend"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server
        .client
        .get(format!("{url}/frontend"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let server = TestServer::start().await;

    let mut config = config_json("broken", IMAGE, config_change());
    config["spec"]["template"]["spec"]["containers"] = json!([]);

    let resp = server
        .client
        .post(server.apps_url("deploymentconfigs"))
        .json(&config)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let status: Value = resp.json().await.unwrap();
    assert!(status["message"].as_str().unwrap().contains("container"));
}

#[tokio::test]
async fn test_instantiate_then_no_content() {
    let server = TestServer::start().await;
    let url = server.apps_url("deploymentconfigs");
    server
        .client
        .post(&url)
        .json(&config_json("api", IMAGE, config_change()))
        .send()
        .await
        .unwrap();

    let resp = server
        .client
        .post(format!("{url}/api/instantiate"))
        .json(&json!({ "latest": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let config: Value = resp.json().await.unwrap();
    assert_eq!(config["status"]["latestVersion"], 1);
    assert_eq!(config["status"]["details"]["message"], "config change");

    // Nothing has been rolled out yet, so the previous version is missing.
    let resp = server
        .client
        .post(format!("{url}/api/instantiate"))
        .json(&json!({ "latest": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server
        .client
        .post(format!("{url}/api/instantiate"))
        .json(&json!({ "name": "other" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .client
        .post(format!("{url}/api/instantiate"))
        .json(&json!({ "force": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let config: Value = resp.json().await.unwrap();
    assert_eq!(config["status"]["latestVersion"], 2);
    assert_eq!(config["status"]["details"]["message"], "manual change");
}

#[tokio::test]
async fn test_unresolved_images_are_reported() {
    let server = TestServer::start().await;
    let url = server.apps_url("deploymentconfigs");
    let triggers = json!([common::image_change("missing:latest")]);
    server
        .client
        .post(&url)
        .json(&config_json("images", IMAGE, triggers))
        .send()
        .await
        .unwrap();

    let resp = server
        .client
        .post(format!("{url}/images/instantiate"))
        .json(&json!({ "latest": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let status: Value = resp.json().await.unwrap();
    assert!(status["message"].as_str().unwrap().contains("unresolved images"));
}

#[tokio::test]
async fn test_rollback_and_cancel_preconditions() {
    let server = TestServer::start().await;
    let url = server.apps_url("deploymentconfigs");
    server
        .client
        .post(&url)
        .json(&config_json("fresh", IMAGE, config_change()))
        .send()
        .await
        .unwrap();

    let resp = server
        .client
        .post(format!("{url}/fresh/rollback"))
        .json(&json!({ "spec": { "includeTemplate": true } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["message"], "cannot rollback an undeployed config");

    let resp = server
        .client
        .post(format!("{url}/fresh/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .client
        .post(format!("{url}/missing/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_image_streams() {
    let server = TestServer::start().await;
    let url = server.apps_url("imagestreams");

    let resp = server
        .client
        .post(&url)
        .json(&image_stream_json("app", "latest", IMAGE))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let stream = server.get_json(&format!("{url}/app")).await.unwrap();
    assert_eq!(stream["status"]["tags"][0]["items"][0]["dockerImageReference"], IMAGE);

    let list = server.get_json(&url).await.unwrap();
    assert_eq!(list["kind"], "ImageStreamList");
    assert_eq!(list["items"].as_array().unwrap().len(), 1);

    let rollouts = server.get_json(&server.apps_url("rollouts")).await.unwrap();
    assert!(rollouts["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_latest_version_only_moves_forward_by_one() {
    let server = TestServer::start().await;
    let url = server.apps_url("deploymentconfigs");

    let mut config = config_json("versions", IMAGE, config_change());
    config["status"] = json!({ "latestVersion": 5, "observedGeneration": 9 });
    let resp = server.client.post(&url).json(&config).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["status"]["latestVersion"], 0);
    assert_eq!(created["status"]["observedGeneration"], 0);

    let item = format!("{url}/versions");
    let mut jumped = created.clone();
    jumped["status"]["latestVersion"] = json!(7);
    let resp = server.client.put(&item).json(&jumped).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let mut next = created.clone();
    next["status"]["latestVersion"] = json!(1);
    let resp = server.client.put(&item).json(&next).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bumped: Value = resp.json().await.unwrap();
    assert_eq!(bumped["status"]["latestVersion"], 1);

    let mut rewound = bumped.clone();
    rewound["status"]["latestVersion"] = json!(0);
    let resp = server.client.put(&item).json(&rewound).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let stored = server.get_json(&item).await.unwrap();
    assert_eq!(stored["status"]["latestVersion"], 1);
}
