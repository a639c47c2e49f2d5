use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use colloquy_core::ids::CustomerId;
use colloquy_engine::tasks::BackgroundTaskService;
use colloquy_engine::Processor;
use colloquy_store::{AgentStore, CustomerStore, InspectionStore, SessionStore};

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8800 }
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<dyn SessionStore>,
    pub agents: Arc<dyn AgentStore>,
    pub customers: Arc<dyn CustomerStore>,
    pub inspections: Arc<dyn InspectionStore>,
    pub processor: Arc<Processor>,
    pub tasks: BackgroundTaskService,
    /// Fallback identity for requests that name no customer.
    pub guest_customer_id: CustomerId,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions/chat_async", post(handlers::chat_async))
        .route("/sessions/:session_id/events", get(handlers::list_session_events))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// A running server; dropping the handle does not stop it — call
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Bind and serve. Returns once the listener is bound; use the handle for
/// shutdown.
pub async fn start(config: ServerConfig, state: AppState) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let port = listener.local_addr()?.port();
    info!(port, "server listening");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let router = build_router(state);

    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port,
        cancel,
        handle,
    })
}
