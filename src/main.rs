use std::env;
use std::sync::Arc;

use access::config::Config;
use access::rpc::{HttpMessageServiceClient, HttpUserServiceClient};
use access::shared::Shared;
use access::ws::{self, AppState};
use access::{events, hub};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();

    let user_rpc = Box::new(HttpUserServiceClient::new(config.user_service_addr.clone()));
    let message_rpc = Box::new(HttpMessageServiceClient::new(
        config.message_service_addr.clone(),
    ));
    let (events_tx, events_rx) = events::channel(config.event_channel_capacity);
    let shared = Arc::new(Shared::new(config, user_rpc, message_rpc));

    tokio::spawn(hub::run(shared.clone(), events_rx));

    let state = AppState {
        shared: shared.clone(),
        events: events_tx,
    };
    let router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/push", post(ws::push_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "access tier listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Cancel the root context so the Hub's dispatcher loop and every
    // still-upgraded WebSocket connection run their close discipline
    // instead of being dropped when the process exits.
    hub::stop(&shared);
    info!("server shut down gracefully");
}

async fn healthz() -> &'static str {
    "ok"
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
