use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use huddle_sfu::{Hub, HubStats};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::ws::websocket_handler;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

pub fn create_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { hub })
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}

/// Serve HTTP and signaling until a shutdown signal arrives
///
/// The hub is shut down as soon as the signal is received so open
/// WebSocket sessions end and the server can finish draining.
pub async fn serve(address: &str, hub: Arc<Hub>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {address}: {e}"))?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    let router = create_router(Arc::clone(&hub));
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing rooms...");
            hub.shutdown();
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
