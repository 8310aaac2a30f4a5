pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Largest request body accepted by the proxy (64 MB). Tunnelled bodies are
/// chunked, so this bounds memory, not the channel.
const MAX_PROXY_BYTES: usize = 64 * 1024 * 1024;

pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // One byte over the ceiling still reaches the handler, which answers 413 itself.
    let call_limit = state.router.max_payload() + 1;
    let event_limit = state.max_event_payload + 1;

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route(
            "/call",
            post(handlers::handle_call).layer(DefaultBodyLimit::max(call_limit)),
        )
        .route(
            "/events",
            post(handlers::handle_event).layer(DefaultBodyLimit::max(event_limit)),
        )
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state.clone());

    let proxy_routes = Router::new()
        .route(
            "/proxy/{*path}",
            any(handlers::handle_proxy).layer(DefaultBodyLimit::max(MAX_PROXY_BYTES)),
        )
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .merge(proxy_routes)
        .layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let mut shutdown = state.shutdown_tx.subscribe();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
