//! Axum router: wires every endpoint to its handler and state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, options, post};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod handlers;

/// Body size cap for `/fork/{fork}/file` publish uploads: 2 GiB.
const PUBLISH_FILE_BODY_LIMIT: usize = 2 * 1024 * 1024 * 1024;

#[must_use]
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::handle_healthz))
        .route("/control/status", get(handlers::handle_status))
        .route("/fork/{fork}/control/update", post(handlers::handle_trigger_update))
        .route("/fork/{fork}", get(handlers::handle_fork_listing))
        .route("/fork/{fork}/manifest", get(handlers::handle_fork_manifest_json))
        .route("/fork/{fork}/version/{version}/file/{file}", get(handlers::handle_fork_file))
        .route("/fork/{fork}/publish", post(handlers::handle_publish_one_shot))
        .route("/fork/{fork}/start", post(handlers::handle_publish_start))
        .route(
            "/fork/{fork}/file",
            post(handlers::handle_publish_file).route_layer(DefaultBodyLimit::max(PUBLISH_FILE_BODY_LIMIT)),
        )
        .route("/fork/{fork}/finish", post(handlers::handle_publish_finish))
        .route("/fork/{fork}/version/{version}/manifest", get(handlers::handle_version_manifest))
        .route(
            "/fork/{fork}/version/{version}/download",
            options(handlers::handle_download_options).post(handlers::handle_download),
        )
        .route("/version/{version}/manifest", get(handlers::handle_legacy_version_manifest))
        .route(
            "/version/{version}/download",
            options(handlers::handle_download_options).post(handlers::handle_legacy_download),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and runs the HTTP server until a ctrl-c signal is received.
pub async fn start_server(bind_addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
