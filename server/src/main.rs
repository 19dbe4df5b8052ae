use axum::{routing::get, Router};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::info;

mod api;
mod dispatch;
mod error;
mod handlers;
mod ingress;
mod mapping;
mod pending;
mod protocol;
mod registry;
mod state;

use state::{AppState, Settings};

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    let state = AppState::new(Settings::default());

    // Periodic heartbeat sweep: evicts agents that went quiet.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.settings.sweep_interval);
            loop {
                ticker.tick().await;
                state.sweep_stale_agents();
            }
        });
    }

    // Operator API on explicit routes; everything else tunnels through
    // the generic ingress.
    let http_app = Router::new()
        .route("/health", get(api::health))
        .route("/status", get(api::status))
        .route("/clients", get(api::list_clients))
        .route("/clients/{id}", get(api::get_client))
        .route("/client/{id}/health", get(api::client_health))
        .route("/route-info", get(api::route_info))
        .fallback(ingress::ingress_handler)
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let tunnel_app = Router::new()
        .route("/ws", get(handlers::ws_handler))
        .with_state(state);

    let http_addr = SocketAddr::from(([0, 0, 0, 0], env_port("PORT", 3000)));
    let ws_addr = SocketAddr::from(([0, 0, 0, 0], env_port("WS_PORT", 3001)));

    info!(
        "🚇 Tunnel relay listening on {} (HTTP) and {} (tunnel)",
        http_addr, ws_addr
    );

    let http_listener = tokio::net::TcpListener::bind(http_addr).await.unwrap();
    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await.unwrap();

    tokio::spawn(async move {
        axum::serve(ws_listener, tunnel_app).await.unwrap();
    });
    axum::serve(http_listener, http_app).await.unwrap();
}
