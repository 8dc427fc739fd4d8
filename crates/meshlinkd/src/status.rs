//! HTTP status endpoint. Read-only JSON views of the overlay, answered by
//! querying the owner task.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use meshlink_core::ResourcePeerInfo;
use meshlink_services::{MessageSummary, OverlayHandle, OverlayStatus, PeerSummary};

#[derive(Clone)]
pub struct StatusState {
    pub overlay: OverlayHandle,
}

type Reply<T> = Result<Json<T>, StatusCode>;

async fn snapshot(state: &StatusState) -> Result<OverlayStatus, StatusCode> {
    state.overlay.status().await.map_err(|e| {
        tracing::warn!(error = %e, "status query failed");
        StatusCode::SERVICE_UNAVAILABLE
    })
}

// ── /status ──────────────────────────────────────────────────────────────────

async fn handle_status(State(state): State<StatusState>) -> Reply<OverlayStatus> {
    snapshot(&state).await.map(Json)
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub target: usize,
    pub peers: Vec<PeerSummary>,
}

async fn handle_peers(State(state): State<StatusState>) -> Reply<PeersResponse> {
    let status = snapshot(&state).await?;
    Ok(Json(PeersResponse {
        target: status.target_peers,
        peers: status.peers,
    }))
}

// ── /resources ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ResourcesResponse {
    pub peers: Vec<ResourcePeerInfo>,
}

async fn handle_resources(State(state): State<StatusState>) -> Reply<ResourcesResponse> {
    let status = snapshot(&state).await?;
    Ok(Json(ResourcesResponse {
        peers: status.resource_peers,
    }))
}

// ── /messages ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessageSummary>,
}

async fn handle_messages(State(state): State<StatusState>) -> Reply<MessagesResponse> {
    let status = snapshot(&state).await?;
    Ok(Json(MessagesResponse {
        messages: status.last_messages,
    }))
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(handle_status))
        .route("/peers", get(handle_peers))
        .route("/resources", get(handle_resources))
        .route("/messages", get(handle_messages))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(
    state: StatusState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
