//! `RoomchatServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use roomchat_core::auth::TokenVerifier;
use secrecy::SecretString;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::handshake::ws_upgrade;
use crate::websocket::rooms::RoomStore;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Room registries.
    pub rooms: Arc<RoomStore>,
    /// Handshake token verifier.
    pub verifier: Arc<TokenVerifier>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, if a recorder was installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RoomchatServer {
    config: Arc<ServerConfig>,
    verifier: Arc<TokenVerifier>,
    rooms: Arc<RoomStore>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RoomchatServer {
    /// Create a new server verifying tokens against `secret`.
    pub fn new(config: ServerConfig, secret: SecretString) -> Self {
        Self {
            config: Arc::new(config),
            verifier: Arc::new(TokenVerifier::new(secret)),
            rooms: Arc::new(RoomStore::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            rooms: self.rooms.clone(),
            verifier: self.verifier.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Also starts the idle-room sweeper. The returned handle completes once
    /// the listener has stopped, open sessions have deregistered (or the
    /// drain window passed), and the sweeper has exited.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, subprotocol = %self.config.subprotocol, "roomchat server listening");

        let token = self.shutdown.token();
        let sweeper = self.rooms.clone().spawn_sweeper(
            self.config.sweep_interval(),
            self.config.room_idle(),
            token.clone(),
        );
        let router = self.router();
        let rooms = self.rooms.clone();
        let shutdown = self.shutdown.clone();
        let drain_window = self.config.send_timeout();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }

            let _ = shutdown.drain_sessions(&rooms, drain_window).await;
            if let Err(e) = sweeper.await {
                warn!(error = %e, "room sweeper ended abnormally");
            }
            info!("roomchat server stopped");
        });

        Ok((addr, handle))
    }

    /// Get the room store.
    pub fn rooms(&self) -> &Arc<RoomStore> {
        &self.rooms
    }

    /// Get the token verifier.
    pub fn verifier(&self) -> &Arc<TokenVerifier> {
        &self.verifier
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.rooms.room_count(),
        state.rooms.connection_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
