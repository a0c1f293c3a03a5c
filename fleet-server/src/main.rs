//! Server entry point.
//!
//! Initializes logging, loads configuration, wires the component graph,
//! and serves the two WebSocket endpoints plus the REST surface.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use fleet_server::config::Config;
use fleet_server::state::AppState;
use fleet_server::store::memory::MemoryStore;
use fleet_server::store::Store;
use fleet_server::{agents, api, clients};

/// How often lapsed terminal sessions are swept.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Structured logging with env-filter support. Default log level is
    // `info` for this crate; override with `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_server=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    let bind_addr = config.bind_addr;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let state = AppState::build(config, store)
        .await
        .expect("state initialization failed");

    // Background sweep: sessions whose token lapsed without a refresh are
    // closed and audited.
    let terminal = state.terminal.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            terminal.sweep_expired().await;
        }
    });

    let app = Router::new()
        .route("/ws/agent", get(agents::ws_handler))   // agent streams
        .route("/ws/client", get(clients::ws_handler)) // operator streams
        .merge(api::router())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("fleet control plane listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
