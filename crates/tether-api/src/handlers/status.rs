//! /status and /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub identity: String,
    /// Chunked calls waiting for their next chunk.
    pub rpc_exchanges: usize,
    /// Tunnelled requests still missing body messages.
    pub tunnel_exchanges: usize,
    /// Requests this daemon sent through the tunnel and is waiting on.
    pub pending_requests: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let rpc_exchanges = state
        .router
        .chunk_server()
        .map(|s| s.in_flight())
        .unwrap_or(0);

    Json(StatusResponse {
        identity: state.identity.clone(),
        rpc_exchanges,
        tunnel_exchanges: state.tunnel_server.in_flight(),
        pending_requests: state.tunnel_client.outstanding(),
    })
}

// ── /daemon/shutdown ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
