use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::connection::run_connection;
use crate::registry::PeerRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PeerRegistry>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(PeerRegistry::new()),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    // WebSocket upgrades are accepted on any path; `/` doubles as the
    // health check for plain GETs.
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .fallback(fallback)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    peers: usize,
}

async fn root(ws: Option<WebSocketUpgrade>, State(state): State<AppState>) -> Response {
    match ws {
        Some(ws) => upgrade(ws, state),
        None => health_check(State(state)).await.into_response(),
    }
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.service_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        peers: state.registry.len().await,
    })
}

async fn fallback(ws: Option<WebSocketUpgrade>, State(state): State<AppState>) -> Response {
    match ws {
        Some(ws) => upgrade(ws, state),
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

fn upgrade(ws: WebSocketUpgrade, state: AppState) -> Response {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| run_connection(socket, registry))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(state, listener).await
}

/// Serve on an already-bound listener (tests bind port 0 and read the
/// assigned address first).
pub async fn serve_listener(
    state: AppState,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting relay HTTP/WebSocket server");

    axum::serve(listener, app).await?;

    Ok(())
}
