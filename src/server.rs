use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState};
use crate::auth::AuthContext;
use crate::config::AppConfig;
use crate::db::{DbHandle, TrackerDb};
use crate::ws;

/// Build the full application router: REST API plus the notification
/// WebSocket.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the tracker server and run until interrupted.
pub async fn start_server(config: AppConfig) -> Result<()> {
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    std::fs::create_dir_all(&config.uploads_dir).context("Failed to create uploads directory")?;

    let db = TrackerDb::new(&config.database_path).context("Failed to initialize database")?;
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let advisory = crate::advisory::Advisory::from_config(&config);
    tracing::info!(mode = advisory.mode(), "AI advisory initialized");

    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        ws_tx,
        advisory,
        auth: AuthContext::new(&config.jwt_secret, config.token_expiry_hours),
        uploads_dir: config.uploads_dir.clone(),
    });

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "tracker listening");
    println!("Tracker running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install Ctrl+C handler");
    }
    println!("\nShutting down...");
}
