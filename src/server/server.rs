use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue, routing::get};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, LosDb};
use super::{push, reminders, ws};
use crate::config::LosConfig;

/// Capacity of the WebSocket fan-out channel.
const WS_CHANNEL_CAPACITY: usize = 256;

/// Runtime switches that are not part of the layered configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    /// Permissive CORS for local frontend development.
    pub dev: bool,
}

/// Build the full application router: REST API plus the WebSocket route.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/{user_email}", get(ws::ws_handler))
        .with_state(state)
}

/// CORS for the configured origins. Credentials are allowed, so methods and
/// headers are mirrored instead of wildcarded.
fn cors_layer(origins: &[String], dev: bool) -> CorsLayer {
    if dev {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

/// Router with CORS and request tracing applied.
pub fn build_app(state: SharedState, options: ServerOptions) -> Router {
    let cors = cors_layer(&state.config.cors_origins, options.dev);
    build_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the LOS server and the reminder scheduler; runs until Ctrl-C.
pub async fn start_server(config: LosConfig, options: ServerOptions) -> Result<()> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = LosDb::new(&config.db_path).context("Failed to initialize database")?;
    let push = push::sender_from_config(config.vapid.as_ref());
    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        config: Arc::new(config),
        hub: ws::WsHub::new(WS_CHANNEL_CAPACITY),
        push,
    });

    let scheduler = reminders::spawn_scheduler(state.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = build_app(state.clone(), options);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        db = %state.config.db_path.display(),
        dev = options.dev,
        push = state.config.vapid.is_some(),
        "LOS server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    scheduler.abort();
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C; shutting down");
        return;
    }
    tracing::info!("shutdown requested");
}
