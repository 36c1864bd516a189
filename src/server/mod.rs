//! HTTP layer: trigger endpoint and run inspection.

pub mod error;
pub mod hooks;
pub mod runs;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::core::dispatcher::Dispatcher;
use crate::core::run_store::RunStore;
use crate::trigger::TriggerReceiver;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub receiver: Arc<TriggerReceiver>,
    pub dispatcher: Dispatcher,
    pub store: Arc<RunStore>,
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(runs::health_check))
        // Trigger
        .route("/hooks/push", post(hooks::receive_push))
        // Inspection
        .route("/runs", get(runs::list_runs))
        .route("/runs/{id}", get(runs::get_run))
        .route("/runs/{id}/cancel", post(runs::cancel_run))
        .route("/target", get(runs::get_target))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the router until the process is stopped
pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind, e))?;
    tracing::info!("Listening on {}", bind);

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
