//! HTTP host for the marketplace front-end.
//!
//! The browser does its own GPS refinement and posts the accepted fix to
//! `/api/reverse`; everything else (IP fallback, search, manual entry,
//! pincode lookup) runs here.

mod handlers;
mod state;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/locate", get(handlers::locate))
        .route("/api/reverse", get(handlers::reverse))
        .route("/api/search", get(handlers::search))
        .route("/api/select", post(handlers::select))
        .route("/api/manual", post(handlers::manual))
        .route("/api/pincode/{pin}", get(handlers::pincode))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn start(config: &Config, host: &str, port: u16) {
    let state = AppState::from_config(config).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });
    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: Cannot bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    eprintln!("  Harvest Locate server listening on http://{}", addr);
    eprintln!("  Press Ctrl+C to stop.");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Server error: {}", e);
            std::process::exit(1);
        });
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("cannot listen for ctrl-c; server runs until killed");
        std::future::pending::<()>().await;
    }
    eprintln!("  Shutting down.");
}
