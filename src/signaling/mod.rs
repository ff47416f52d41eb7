#![forbid(unsafe_code)]

// Signaling module - WebSocket gateway, health, metrics, and upload routes

pub mod protocol;
pub mod connection;

use crate::metrics::ServerMetrics;
use crate::room::RoomCoordinator;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

/// Query parameters for the WebSocket upgrade. The device fingerprint is
/// part of the admission check, so it must arrive before a session exists.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default, rename = "deviceId")]
    pub device_id: Option<String>,
}

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    coordinator: Arc<RoomCoordinator>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    upload_dir: PathBuf,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(coordinator: Arc<RoomCoordinator>, metrics: ServerMetrics) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        let upload_dir = PathBuf::from(std::env::var("UPLOAD_DIR").unwrap_or_else(|_| "./uploads".into()));
        info!("Upload directory: {}", upload_dir.display());

        Self {
            coordinator,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            upload_dir,
        }
    }

    pub fn coordinator(&self) -> &Arc<RoomCoordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn upload_dir(&self) -> &PathBuf {
        &self.upload_dir
    }

    /// Creates the Axum router for the server
    pub fn router(self) -> Router {
        let uploads = ServeDir::new(self.upload_dir.clone());
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/upload", post(crate::upload::handle_upload))
            .nest_service("/uploads", uploads)
            .with_state(self)
            .layer(CorsLayer::permissive())
            .fallback_service(ServeDir::new("public"))
    }

    /// Starts the server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let users = server.coordinator.user_count().await;
    let waiting = server.coordinator.queue_len().await;
    Json(serde_json::json!({
        "status": "ok",
        "users": users,
        "queueWaiting": waiting,
    }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Response {
    // Check bearer token if METRICS_TOKEN is configured
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers.get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {}", expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let users = server.coordinator.user_count().await;
    let waiting = server.coordinator.queue_len().await;
    let body = server.metrics.render_prometheus(users, waiting);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ).into_response()
}

/// WebSocket upgrade handler. Banned peers are refused here, before any
/// session state exists.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ConnectQuery>,
    State(server): State<SignalingServer>,
) -> Response {
    let device_id = query.device_id.unwrap_or_default();

    if server.coordinator.registry().is_banned(&addr.ip().to_string(), &device_id) {
        info!("Refusing banned connection from {} (device {})", addr.ip(), device_id);
        return (StatusCode::FORBIDDEN, crate::error::ChatError::Banned.to_string()).into_response();
    }

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.coordinator,
                server.metrics,
                addr,
                device_id,
                permit,
            )
        })
}
