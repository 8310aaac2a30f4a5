//! tether integration test harness.
//!
//! Two in-process peers, "alpha" and "bravo", wired to each other over
//! loopback transports that enforce the channel ceilings. Each peer has a
//! method router with a chunk server, a tunnel server forwarding to a
//! downstream base URL, and a tunnel client publishing to the other peer.
//!
//!   cargo test --test integration
//!
//! Tests that need a downstream spawn a real axum server on an ephemeral
//! port via [`spawn_downstream`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use bytes::Bytes;
use futures::future::BoxFuture;
use rand::RngCore;

use tether_core::config::{RpcSettings, TunnelSettings};
use tether_core::TetherError;
use tether_services::{
    CallTransport, ChunkMethodClient, ChunkMethodServer, EventTransport, HttpTunnelClient,
    HttpTunnelServer, LoopbackCallTransport, LoopbackEventTransport, MethodError, MethodRequest,
    MethodRouter, ReqwestClient,
};

mod proxy;
mod rpc;
mod tunnel;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const ALPHA: &str = "alpha";
pub const BRAVO: &str = "bravo";

/// Port nothing listens on; downstream calls to it are refused.
pub const DEAD_DOWNSTREAM: &str = "http://127.0.0.1:9";

pub struct Settings {
    pub max_call_payload: usize,
    pub max_event_payload: usize,
    pub downstream_url: String,
    pub request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // 66% of this is exactly 64 KB of raw payload per chunk.
            max_call_payload: 99_297,
            max_event_payload: 64 * 1024,
            downstream_url: DEAD_DOWNSTREAM.to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport wrapper counting every call or publish that passes through.
pub struct Counted<T> {
    inner: T,
    count: AtomicUsize,
}

impl<T> Counted<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            count: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

impl<T: CallTransport> CallTransport for Counted<T> {
    fn max_payload_size(&self) -> usize {
        self.inner.max_payload_size()
    }

    fn invoke<'a>(
        &'a self,
        target: &'a str,
        operation: &'a str,
        payload: Bytes,
        content_type: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Bytes, TetherError>> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner
            .invoke(target, operation, payload, content_type, timeout)
    }
}

impl<T: EventTransport> EventTransport for Counted<T> {
    fn max_payload_size(&self) -> usize {
        self.inner.max_payload_size()
    }

    fn publish<'a>(
        &'a self,
        payload: Bytes,
        id: &'a str,
        schema: &'a str,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<(), TetherError>> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.publish(payload, id, schema, content_type)
    }
}

/// One side of a connected pair.
pub struct Peer {
    pub name: &'static str,
    pub router: MethodRouter,
    pub chunk_server: Arc<ChunkMethodServer>,
    pub tunnel_server: Arc<HttpTunnelServer>,
    pub tunnel_client: HttpTunnelClient,
    /// Chunked RPC client calling the other peer.
    pub rpc: ChunkMethodClient,
    /// Outbound call primitive to the other peer.
    pub calls: Arc<Counted<LoopbackCallTransport>>,
    /// Outbound event primitive to the other peer.
    pub events: Arc<Counted<LoopbackEventTransport>>,
}

fn router(max_call_payload: usize) -> (MethodRouter, Arc<ChunkMethodServer>) {
    let router = MethodRouter::new(max_call_payload);
    router.register_raw("Echo", |req: MethodRequest| async move {
        Ok::<_, MethodError>(req.payload)
    });
    router.register_raw("Reject", |_| async move {
        Err::<Bytes, _>(MethodError::bad_request("rejected by handler"))
    });
    router.register_raw("Explode", |_| async move {
        Err::<Bytes, _>(MethodError::Internal(anyhow::anyhow!("handler blew up")))
    });
    let chunk_server = Arc::new(ChunkMethodServer::new(&RpcSettings::default()));
    router
        .attach_chunk_server(chunk_server.clone())
        .expect("fresh router");
    (router, chunk_server)
}

fn tunnel_server(settings: &Settings, callback: ChunkMethodClient) -> Arc<HttpTunnelServer> {
    let downstream = ReqwestClient::new(&settings.downstream_url, settings.request_timeout)
        .expect("reqwest client");
    Arc::new(HttpTunnelServer::new(
        Arc::new(downstream),
        callback,
        settings.max_event_payload,
        &TunnelSettings::default(),
    ))
}

/// Build two peers connected to each other.
pub fn pair(settings: &Settings) -> (Peer, Peer) {
    let (a_router, a_chunks) = router(settings.max_call_payload);
    let (b_router, b_chunks) = router(settings.max_call_payload);

    let a_calls = Arc::new(Counted::new(LoopbackCallTransport::new(
        b_router.clone(),
        settings.max_call_payload,
    )));
    let b_calls = Arc::new(Counted::new(LoopbackCallTransport::new(
        a_router.clone(),
        settings.max_call_payload,
    )));
    let a_rpc = ChunkMethodClient::new(a_calls.clone(), settings.request_timeout);
    let b_rpc = ChunkMethodClient::new(b_calls.clone(), settings.request_timeout);

    let a_server = tunnel_server(settings, a_rpc.clone());
    let b_server = tunnel_server(settings, b_rpc.clone());

    let a_events = Arc::new(Counted::new(LoopbackEventTransport::new(
        b_server.clone(),
        ALPHA,
        settings.max_event_payload,
    )));
    let b_events = Arc::new(Counted::new(LoopbackEventTransport::new(
        a_server.clone(),
        BRAVO,
        settings.max_event_payload,
    )));

    let a_client = HttpTunnelClient::new(a_events.clone(), settings.request_timeout);
    a_client.attach(&a_router);
    let b_client = HttpTunnelClient::new(b_events.clone(), settings.request_timeout);
    b_client.attach(&b_router);

    let alpha = Peer {
        name: ALPHA,
        router: a_router,
        chunk_server: a_chunks,
        tunnel_server: a_server,
        tunnel_client: a_client,
        rpc: a_rpc,
        calls: a_calls,
        events: a_events,
    };
    let bravo = Peer {
        name: BRAVO,
        router: b_router,
        chunk_server: b_chunks,
        tunnel_server: b_server,
        tunnel_client: b_client,
        rpc: b_rpc,
        calls: b_calls,
        events: b_events,
    };
    (alpha, bravo)
}

/// Incompressible bytes, so chunk counts follow payload size.
pub fn noise(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

// ── Downstream ────────────────────────────────────────────────────────────────

async fn echo(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let mut out = HeaderMap::new();
    let content_type = headers
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    out.insert(CONTENT_TYPE, content_type);
    if let Some(trace) = headers.get("x-trace") {
        out.insert("x-trace", trace.clone());
    }
    (out, body)
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(30)).await;
    "late"
}

/// Serve a small HTTP app on an ephemeral port and return its base URL.
pub async fn spawn_downstream() -> String {
    let app = axum::Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/echo", post(echo))
        .route("/status/{code}", get(status))
        .route("/slow", get(slow));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind downstream");
    let addr = listener.local_addr().expect("downstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}
