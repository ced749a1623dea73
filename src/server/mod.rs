use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::hooks::HookRegistry;
use crate::ingest::{EventReceiver, IngestQueue};
use crate::state::StateBroadcaster;
use crate::store::RegistrationStore;
use crate::thumbnails::ThumbnailCache;

pub mod auth;
pub mod error;
pub mod routes_events;
pub mod routes_images;
pub mod routes_maintenance;
pub mod routes_thumbnails;
pub mod routes_ws;

pub use error::AppError;

/// Shared handler context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    /// Canonical watched root
    pub root: PathBuf,
    pub store: Arc<RegistrationStore>,
    pub broadcaster: Arc<StateBroadcaster>,
    pub thumbnails: ThumbnailCache,
    pub receiver: Arc<EventReceiver>,
    pub queue: IngestQueue,
    pub hooks: Arc<HookRegistry>,
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static(auth::SIGNATURE_HEADER)]);

    let api = routes_events::event_routes()
        .merge(routes_images::image_routes())
        .merge(routes_thumbnails::thumbnail_routes())
        .merge(routes_maintenance::maintenance_routes());

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .merge(routes_ws::ws_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Bind the configured address.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("Invalid server address")?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn serve(listener: TcpListener, ctx: AppContext, cancel: CancellationToken) -> Result<()> {
    let app = create_router(ctx);
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Starting server on {}", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
