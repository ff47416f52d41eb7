#![forbid(unsafe_code)]

use anyhow::Result;
use openmic::metrics::ServerMetrics;
use openmic::persistence::Store;
use openmic::registry::Registry;
use openmic::room::permissions::PermissionMatrix;
use openmic::room::settings::RoomSettings;
use openmic::room::RoomCoordinator;
use openmic::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openmic=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("OpenMic - Starting server");

    // Load persisted state: admin accounts, ban list, permission matrix
    let store = Store::from_env();
    let registry = Registry::load(store.clone());
    let matrix: PermissionMatrix = store.load_or_default("role-permissions");

    let settings = RoomSettings::from_env();
    let metrics = ServerMetrics::new();

    let coordinator = Arc::new(RoomCoordinator::new(
        settings,
        matrix,
        registry,
        store,
        metrics.clone(),
    ));

    info!("Room coordinator initialized");

    let server = SignalingServer::new(coordinator.clone(), metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            coordinator.flush().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
