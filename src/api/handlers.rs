use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::server::AppState;
use crate::cancel::cancel_latest;
use crate::error::ApiError;
use crate::models::{
    DeploymentConfig, DeploymentConfigRollback, DeploymentConfigStatus, DeploymentRequest,
    ImageStream, Object, Rollout, Selector,
};

const APPS_API_VERSION: &str = "apps.krollout.io/v1";

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(rename = "labelSelector")]
    label_selector: Option<String>,
}

impl ListParams {
    fn selector(&self) -> Result<Selector, ApiError> {
        parse_selector(self.label_selector.as_deref().unwrap_or_default())
    }
}

/// Parses `key=value` pairs separated by commas.
pub fn parse_selector(raw: &str) -> Result<Selector, ApiError> {
    let mut selector = Selector::new();
    for term in raw.split(',').map(str::trim).filter(|term| !term.is_empty()) {
        let (key, value) = term
            .split_once("==")
            .or_else(|| term.split_once('='))
            .ok_or_else(|| ApiError::BadRequest(format!("unsupported label selector term {term:?}")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ApiError::BadRequest(format!("label selector term {term:?} has no key")));
        }
        selector.insert(key.to_string(), value.trim().to_string());
    }
    Ok(selector)
}

fn list_body<T: Object>(api_version: &str, items: Vec<T>) -> Json<Value> {
    Json(json!({
        "apiVersion": api_version,
        "kind": format!("{}List", T::KIND),
        "items": items,
    }))
}

/// Takes the namespace from the path and insists on a matching name.
fn scope<T: Object>(object: &mut T, namespace: &str, name: Option<&str>) -> Result<(), ApiError> {
    let meta = object.meta_mut();
    if let Some(ns) = meta.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        if ns != namespace {
            return Err(ApiError::BadRequest(format!(
                "namespace {ns:?} does not match the request namespace {namespace:?}"
            )));
        }
    }
    meta.namespace = Some(namespace.to_string());
    if let Some(name) = name {
        match meta.name.as_deref() {
            None | Some("") => meta.name = Some(name.to_string()),
            Some(given) if given != name => {
                return Err(ApiError::BadRequest(format!(
                    "name {given:?} does not match the request name {name:?}"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

// DeploymentConfig handlers
pub async fn list_configs(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let configs = state.clients.configs.list(Some(&namespace), &params.selector()?).await?;
    Ok(list_body(APPS_API_VERSION, configs))
}

pub async fn create_config(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Json(mut config): Json<DeploymentConfig>,
) -> Result<(StatusCode, Json<DeploymentConfig>), ApiError> {
    scope(&mut config, &namespace, None)?;
    config.validate().map_err(ApiError::Invalid)?;
    // Status is owned by the controllers.
    config.status = DeploymentConfigStatus::default();
    let created = state.clients.configs.create(&config).await?;
    info!(config = %created.key(), "created deployment config");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_config(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<DeploymentConfig>, ApiError> {
    Ok(Json(state.clients.configs.get(&namespace, &name).await?))
}

pub async fn update_config(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(mut config): Json<DeploymentConfig>,
) -> Result<Json<DeploymentConfig>, ApiError> {
    scope(&mut config, &namespace, Some(&name))?;
    config.validate().map_err(ApiError::Invalid)?;

    let current = state.clients.configs.get(&namespace, &name).await?;
    config.status = carry_status(&current, config.status.latest_version)?;
    if config.metadata.resource_version.is_none() {
        config.metadata.resource_version = current.metadata.resource_version.clone();
    }
    Ok(Json(state.clients.configs.update(&config).await?))
}

/// Keeps the stored status. The only client-side status change accepted is
/// a single version bump, which is how a rollback candidate gets persisted.
fn carry_status(
    current: &DeploymentConfig,
    requested_version: i64,
) -> Result<DeploymentConfigStatus, ApiError> {
    let mut status = current.status.clone();
    let latest = status.latest_version;
    if requested_version == latest + 1 {
        status.latest_version = requested_version;
    } else if requested_version != latest {
        return Err(ApiError::Invalid(format!(
            "status.latestVersion may only move from {latest} to {}, got {requested_version}",
            latest + 1
        )));
    }
    Ok(status)
}

pub async fn delete_config(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.clients.configs.delete(&namespace, &name).await?;
    info!(config = %format!("{namespace}/{name}"), "deleted deployment config");
    Ok(StatusCode::OK)
}

pub async fn instantiate_config(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(mut request): Json<DeploymentRequest>,
) -> Result<(StatusCode, Json<DeploymentConfig>), ApiError> {
    if request.name.is_empty() {
        request.name = name;
    } else if request.name != name {
        return Err(ApiError::BadRequest(format!(
            "request name {:?} does not match {name:?}",
            request.name
        )));
    }
    let updated = state.instantiator.instantiate(&namespace, &request).await?;
    Ok((StatusCode::CREATED, Json(updated)))
}

pub async fn rollback_config(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(mut request): Json<DeploymentConfigRollback>,
) -> Result<Json<DeploymentConfig>, ApiError> {
    if request.name.is_empty() {
        request.name = name;
    } else if request.name != name {
        return Err(ApiError::BadRequest(format!(
            "request name {:?} does not match {name:?}",
            request.name
        )));
    }
    Ok(Json(state.rollback.rollback(&namespace, &request).await?))
}

pub async fn cancel_config(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Rollout>, ApiError> {
    let rollout = cancel_latest(
        state.clients.configs.as_ref(),
        state.clients.rollouts.as_ref(),
        &namespace,
        &name,
    )
    .await?;
    Ok(Json(rollout))
}

// ImageStream handlers
pub async fn list_image_streams(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let streams = state
        .clients
        .image_streams
        .list(Some(&namespace), &params.selector()?)
        .await?;
    Ok(list_body(APPS_API_VERSION, streams))
}

pub async fn create_image_stream(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Json(mut stream): Json<ImageStream>,
) -> Result<(StatusCode, Json<ImageStream>), ApiError> {
    scope(&mut stream, &namespace, None)?;
    let created = state.clients.image_streams.create(&stream).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_image_stream(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ImageStream>, ApiError> {
    Ok(Json(state.clients.image_streams.get(&namespace, &name).await?))
}

pub async fn update_image_stream(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(mut stream): Json<ImageStream>,
) -> Result<Json<ImageStream>, ApiError> {
    scope(&mut stream, &namespace, Some(&name))?;
    Ok(Json(state.clients.image_streams.update(&stream).await?))
}

// Rollout handlers
pub async fn list_rollouts(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let rollouts = state.clients.rollouts.list(Some(&namespace), &params.selector()?).await?;
    Ok(list_body(APPS_API_VERSION, rollouts))
}

pub async fn get_rollout(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Rollout>, ApiError> {
    Ok(Json(state.clients.rollouts.get(&namespace, &name).await?))
}

// Pod handlers
pub async fn list_pods(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let pods = state.clients.pods.list(Some(&namespace), &params.selector()?).await?;
    Ok(list_body("v1", pods))
}

pub async fn get_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Pod>, ApiError> {
    Ok(Json(state.clients.pods.get(&namespace, &name).await?))
}

/// Worker pods report their progress by replacing their status.
pub async fn update_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(mut pod): Json<Pod>,
) -> Result<Json<Pod>, ApiError> {
    scope(&mut pod, &namespace, Some(&name))?;
    Ok(Json(state.clients.pods.update(&pod).await?))
}

pub async fn list_events(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let events = state.recorder.list(&namespace).await?;
    Ok(Json(json!({
        "apiVersion": "v1",
        "kind": "EventList",
        "items": events,
    })))
}
