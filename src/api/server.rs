use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::events::EventRecorder;
use crate::instantiate::Instantiate;
use crate::rollback::RollbackService;
use crate::storage::Clients;
use crate::Storage;

#[derive(Clone)]
pub struct AppState {
    pub clients: Clients,
    pub instantiator: Arc<dyn Instantiate>,
    pub rollback: Arc<RollbackService>,
    pub recorder: Arc<dyn EventRecorder>,
    /// Checked by `/readyz` when the stores are SQLite-backed.
    pub storage: Option<Storage>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/livez", get(liveness))
        .route("/readyz", get(readiness))
        .nest("/apis/apps.krollout.io/v1", super::routes::apps_routes())
        .nest("/api/v1", super::routes::core_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(state: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("krollout API server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn readiness(State(state): State<AppState>) -> StatusCode {
    let Some(storage) = &state.storage else {
        return StatusCode::OK;
    };
    match sqlx::query("SELECT 1").fetch_one(&*storage.pool).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
