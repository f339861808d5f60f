use axum::{
    routing::{get, post},
    Router,
};

use super::handlers;
use super::server::AppState;

/// Routes under `/apis/apps.krollout.io/v1`.
pub fn apps_routes() -> Router<AppState> {
    Router::new()
        // DeploymentConfig routes
        .route(
            "/namespaces/:namespace/deploymentconfigs",
            get(handlers::list_configs).post(handlers::create_config),
        )
        .route(
            "/namespaces/:namespace/deploymentconfigs/:name",
            get(handlers::get_config)
                .put(handlers::update_config)
                .delete(handlers::delete_config),
        )
        .route(
            "/namespaces/:namespace/deploymentconfigs/:name/instantiate",
            post(handlers::instantiate_config),
        )
        .route(
            "/namespaces/:namespace/deploymentconfigs/:name/rollback",
            post(handlers::rollback_config),
        )
        .route(
            "/namespaces/:namespace/deploymentconfigs/:name/cancel",
            post(handlers::cancel_config),
        )
        // ImageStream routes
        .route(
            "/namespaces/:namespace/imagestreams",
            get(handlers::list_image_streams).post(handlers::create_image_stream),
        )
        .route(
            "/namespaces/:namespace/imagestreams/:name",
            get(handlers::get_image_stream).put(handlers::update_image_stream),
        )
        // Rollout routes
        .route("/namespaces/:namespace/rollouts", get(handlers::list_rollouts))
        .route(
            "/namespaces/:namespace/rollouts/:name",
            get(handlers::get_rollout),
        )
}

/// Routes under `/api/v1`.
pub fn core_routes() -> Router<AppState> {
    Router::new()
        .route("/namespaces/:namespace/pods", get(handlers::list_pods))
        .route(
            "/namespaces/:namespace/pods/:name",
            get(handlers::get_pod).put(handlers::update_pod),
        )
        .route("/namespaces/:namespace/events", get(handlers::list_events))
}
