//! In-memory transports. Both ends live in this process; payload ceilings
//! are enforced exactly as a network transport would.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tether_core::TetherError;

use crate::router::MethodRouter;
use crate::transport::{check_limit, CallTransport, EventMessage, EventTransport};
use crate::tunnel_server::HttpTunnelServer;

/// Call primitive delivering straight into a local [`MethodRouter`].
pub struct LoopbackCallTransport {
    router: MethodRouter,
    max_payload: usize,
}

impl LoopbackCallTransport {
    pub fn new(router: MethodRouter, max_payload: usize) -> Self {
        Self {
            router,
            max_payload,
        }
    }
}

impl CallTransport for LoopbackCallTransport {
    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn invoke<'a>(
        &'a self,
        target: &'a str,
        operation: &'a str,
        payload: Bytes,
        content_type: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Bytes, TetherError>> {
        Box::pin(async move {
            check_limit(payload.len(), self.max_payload)?;
            tracing::trace!(peer = target, operation, bytes = payload.len(), "loopback call");

            let call = self.router.invoke(operation, payload, content_type);
            let response = tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| TetherError::Timeout(timeout))??;

            check_limit(response.payload.len(), self.max_payload)?;
            if !response.is_success() {
                return Err(TetherError::RemoteStatus {
                    status: response.status,
                    body: String::from_utf8_lossy(&response.payload).into_owned(),
                });
            }
            Ok(response.payload)
        })
    }
}

/// Event primitive feeding a local [`HttpTunnelServer`].
///
/// Messages are ingested during `publish`, so they arrive in publish order;
/// completed requests are dispatched on their own task.
pub struct LoopbackEventTransport {
    server: Arc<HttpTunnelServer>,
    source: String,
    max_payload: usize,
}

impl LoopbackEventTransport {
    /// `source` is the identity the server calls back with the response.
    pub fn new(server: Arc<HttpTunnelServer>, source: &str, max_payload: usize) -> Self {
        Self {
            server,
            source: source.to_string(),
            max_payload,
        }
    }
}

impl EventTransport for LoopbackEventTransport {
    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn publish<'a>(
        &'a self,
        payload: Bytes,
        id: &'a str,
        schema: &'a str,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<(), TetherError>> {
        Box::pin(async move {
            check_limit(payload.len(), self.max_payload)?;
            let event = EventMessage {
                source: self.source.clone(),
                id: id.to_string(),
                schema: schema.to_string(),
                content_type: content_type.to_string(),
                payload,
            };
            // The publisher never learns how the receiver fared.
            if let Err(e) = self.server.accept(&event) {
                tracing::warn!(id, error = %e, "loopback event rejected");
            }
            Ok(())
        })
    }
}
