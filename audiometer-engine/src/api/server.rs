//! HTTP server setup and routing

use crate::error::{Error, Result};
use crate::session::SessionRunner;
use crate::state::SharedState;
use audiometer_common::TestConfiguration;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub state: Arc<SharedState>,
    pub runner: Arc<SessionRunner>,
    /// Configuration every session starts from; requests may override parts
    pub base_config: Arc<TestConfiguration>,
}

/// Build the router with all routes
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(super::handlers::health))
        .route("/audio/devices", get(super::handlers::list_audio_devices))
        // Session control
        .route("/test/start", post(super::handlers::start_test))
        .route("/test/stop", post(super::handlers::stop_test))
        .route("/test/state", get(super::handlers::get_state))
        .route("/test/results", get(super::handlers::get_results))
        .route("/test/interpretation", get(super::handlers::get_interpretation))
        // Patient response button
        .route("/response/press", post(super::handlers::press))
        .route("/response/release", post(super::handlers::release))
        // History
        .route("/history", get(super::handlers::list_history))
        .route("/history/:session_id", get(super::handlers::get_history_session))
        // SSE event stream
        .route("/events", get(super::sse::event_stream))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Run HTTP API server until `shutdown` resolves
pub async fn run<F>(ctx: AppContext, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(ctx);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Http(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Http(format!("Server error: {}", e)))?;

    Ok(())
}
