mod common;

use common::{config_change, config_json, eventually, image_change, image_stream_json, TestServer};
use krollout::deployutil::{
    CANCELLED_ANNOTATION, DEPLOYMENT_ANNOTATION, STATUS_ANNOTATION, STATUS_REASON_ANNOTATION,
};
use reqwest::StatusCode;
use serde_json::{json, Value};

const IMAGE: &str = "registry.local/app@sha256:0001";
const PUSHED: &str = "registry.local/app@sha256:0002";

fn annotation<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object["metadata"]["annotations"][key].as_str()
}

async fn rollout_in_phase(server: &TestServer, name: &str, phase: &str) -> Value {
    let url = server.apps_url(&format!("rollouts/{name}"));
    eventually(&format!("rollout {name} to reach {phase}"), || async {
        server
            .get_json(&url)
            .await
            .filter(|rollout| annotation(rollout, STATUS_ANNOTATION) == Some(phase))
    })
    .await
}

async fn set_pod_phase(server: &TestServer, name: &str, phase: &str) {
    let url = server.core_url(&format!("pods/{name}"));
    let mut pod = server.get_json(&url).await.expect("worker pod exists");
    pod["status"] = json!({ "phase": phase });
    let resp = server.client.put(&url).json(&pod).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_config_change_rolls_out_to_completion() {
    let server = TestServer::start_with_controllers().await;

    let resp = server
        .client
        .post(server.apps_url("deploymentconfigs"))
        .json(&config_json("web", IMAGE, config_change()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let rollout = rollout_in_phase(&server, "web-1", "Pending").await;
    assert_eq!(rollout["spec"]["replicas"], 0);
    assert_eq!(annotation(&rollout, STATUS_REASON_ANNOTATION), Some("config change"));

    let pod = server
        .get_json(&server.core_url("pods/deploy-web-1"))
        .await
        .expect("worker pod");
    assert_eq!(annotation(&pod, DEPLOYMENT_ANNOTATION), Some("web-1"));
    assert_eq!(pod["spec"]["restartPolicy"], "Never");
    assert_eq!(pod["spec"]["containers"][0]["name"], "deployment");

    set_pod_phase(&server, "deploy-web-1", "Running").await;
    rollout_in_phase(&server, "web-1", "Running").await;

    set_pod_phase(&server, "deploy-web-1", "Succeeded").await;
    rollout_in_phase(&server, "web-1", "Complete").await;

    let pod_url = server.core_url("pods/deploy-web-1");
    eventually("worker pod cleanup", || async {
        server.get_json(&pod_url).await.is_none().then_some(())
    })
    .await;

    let config_url = server.apps_url("deploymentconfigs/web");
    let config = eventually("config status sync", || async {
        server
            .get_json(&config_url)
            .await
            .filter(|config| config["status"]["observedGeneration"] == config["metadata"]["generation"])
    })
    .await;
    assert_eq!(config["status"]["latestVersion"], 1);

    let events = server.get_json(&server.core_url("events")).await.unwrap();
    let reasons: Vec<&str> = events["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|event| event["reason"].as_str())
        .collect();
    assert!(reasons.contains(&"DeploymentCreated"), "{reasons:?}");

    server.shutdown().await;
}

#[tokio::test]
async fn test_image_push_triggers_a_new_version() {
    let server = TestServer::start_with_controllers().await;

    let triggers = json!([{ "type": "ConfigChange" }, image_change("app:latest")]);
    server
        .client
        .post(server.apps_url("deploymentconfigs"))
        .json(&config_json("api", "", triggers))
        .send()
        .await
        .unwrap();

    server
        .client
        .post(server.apps_url("imagestreams"))
        .json(&image_stream_json("app", "latest", PUSHED))
        .send()
        .await
        .unwrap();

    let config_url = server.apps_url("deploymentconfigs/api");
    let config = eventually("first version", || async {
        server
            .get_json(&config_url)
            .await
            .filter(|config| config["status"]["latestVersion"] == 1)
    })
    .await;
    assert_eq!(config["spec"]["template"]["spec"]["containers"][0]["image"], PUSHED);
    assert_eq!(
        config["spec"]["triggers"][1]["imageChangeParams"]["lastTriggeredImage"],
        PUSHED
    );

    let rollout = rollout_in_phase(&server, "api-1", "Pending").await;
    let template_image = &rollout["spec"]["template"]["spec"]["containers"][0]["image"];
    assert_eq!(template_image, PUSHED);

    server.shutdown().await;
}

#[tokio::test]
async fn test_cancel_fails_the_running_rollout() {
    let server = TestServer::start_with_controllers().await;

    server
        .client
        .post(server.apps_url("deploymentconfigs"))
        .json(&config_json("batch", IMAGE, config_change()))
        .send()
        .await
        .unwrap();
    rollout_in_phase(&server, "batch-1", "Pending").await;

    let resp = server
        .client
        .post(server.apps_url("deploymentconfigs/batch/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let cancelled: Value = resp.json().await.unwrap();
    assert_eq!(annotation(&cancelled, CANCELLED_ANNOTATION), Some("true"));

    let rollout = rollout_in_phase(&server, "batch-1", "Failed").await;
    assert_eq!(annotation(&rollout, STATUS_REASON_ANNOTATION), Some("cancelled by user"));

    let resp = server
        .client
        .post(server.apps_url("deploymentconfigs/batch/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    server.shutdown().await;
}

#[tokio::test]
async fn test_rollback_candidate_from_history() {
    let server = TestServer::start_with_controllers().await;
    let configs = server.apps_url("deploymentconfigs");

    server
        .client
        .post(&configs)
        .json(&config_json("shop", IMAGE, config_change()))
        .send()
        .await
        .unwrap();
    rollout_in_phase(&server, "shop-1", "Pending").await;
    set_pod_phase(&server, "deploy-shop-1", "Succeeded").await;
    rollout_in_phase(&server, "shop-1", "Complete").await;

    // Controllers keep writing status, so retry the edit until it lands.
    let config_url = format!("{configs}/shop");
    eventually("template edit", || async {
        let mut config = server.get_json(&config_url).await?;
        config["spec"]["template"]["spec"]["containers"][0]["image"] = json!(PUSHED);
        let resp = server.client.put(&config_url).json(&config).send().await.ok()?;
        resp.status().is_success().then_some(())
    })
    .await;

    rollout_in_phase(&server, "shop-2", "Pending").await;

    let resp = server
        .client
        .post(format!("{config_url}/rollback"))
        .json(&json!({ "spec": { "includeTemplate": true } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let candidate: Value = resp.json().await.unwrap();
    assert_eq!(candidate["status"]["latestVersion"], 3);
    assert_eq!(candidate["spec"]["template"]["spec"]["containers"][0]["image"], IMAGE);

    let stored = server.get_json(&config_url).await.unwrap();
    assert_eq!(stored["status"]["latestVersion"], 2, "rollback must not persist");

    server.shutdown().await;
}
