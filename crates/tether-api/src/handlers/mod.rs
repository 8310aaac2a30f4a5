//! HTTP API handlers — the daemon's side of the call and event primitives,
//! plus the tunnelled proxy.

pub mod call;
pub mod events;
pub mod proxy;
pub mod status;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tether_core::wire::JSON_CONTENT_TYPE;
use tether_core::TetherError;
use tether_services::{HttpTunnelClient, HttpTunnelServer, MethodRouter};

#[derive(Clone)]
pub struct ApiState {
    /// Name this daemon publishes events under.
    pub identity: String,
    pub router: MethodRouter,
    pub tunnel_server: Arc<HttpTunnelServer>,
    pub tunnel_client: HttpTunnelClient,
    pub max_event_payload: usize,
    /// Shutdown broadcast sender — signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, (StatusCode, String)> {
    header(headers, name).ok_or_else(|| (StatusCode::BAD_REQUEST, format!("missing {name} header")))
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Structured error response for a failure that never reached a handler.
fn error_response(error: &TetherError) -> Response {
    let body = serde_json::json!({ "message": error.to_string() }).to_string();
    (
        status_code(error.status()),
        [(axum::http::header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

// Re-export handler functions for use in router setup.
pub use call::handle_call;
pub use events::handle_event;
pub use proxy::handle_proxy;
pub use status::{handle_shutdown, handle_status};
