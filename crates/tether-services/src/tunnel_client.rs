//! HTTP tunnel client — sends HTTP requests as event messages and waits for
//! the answer to come back through the call channel.
//!
//! The first message carries the header envelope plus as much of the
//! compressed body as fits; the rest of the body follows in numbered
//! messages. The response is delivered out of band to
//! [`TUNNEL_RESPONSE_OPERATION`], which resolves the matching pending
//! completion.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tether_core::compress::{compress, decompress};
use tether_core::sequencer::{chunk_count, split};
use tether_core::wire::{
    self, mint_id, EventTag, TunnelRequestHeader, TunnelResponse, FRAME_PREFIX_LEN,
    TUNNEL_REQUEST_SCHEMA, TUNNEL_RESPONSE_OPERATION,
};
use tether_core::{HttpRequest, HttpResponse, TetherError};
use tokio_util::sync::CancellationToken;

use crate::downstream::HttpClient;
use crate::pending::PendingCompletions;
use crate::router::{MethodError, MethodRouter};
use crate::transport::{check_limit, EventTransport};

/// Tunnelled [`HttpClient`]. Cheap to clone.
#[derive(Clone)]
pub struct HttpTunnelClient {
    events: Arc<dyn EventTransport>,
    pending: PendingCompletions<TunnelResponse>,
    request_timeout: Duration,
}

impl HttpTunnelClient {
    pub fn new(events: Arc<dyn EventTransport>, request_timeout: Duration) -> Self {
        Self {
            events,
            pending: PendingCompletions::new(),
            request_timeout,
        }
    }

    /// Requests still waiting for their response.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Register the response operation on the router that the remote end calls back.
    pub fn attach(&self, router: &MethodRouter) {
        let pending = self.pending.clone();
        router.register_json(TUNNEL_RESPONSE_OPERATION, move |response: TunnelResponse| {
            let pending = pending.clone();
            async move {
                let id = response.request_id.clone();
                if pending.resolve(&id, Ok(response)) {
                    tracing::debug!(request_id = %id, "tunnel response delivered");
                    Ok(())
                } else {
                    tracing::warn!(request_id = %id, "tunnel response for unknown request, dropping");
                    Err(MethodError::status(
                        wire::status::NOT_FOUND,
                        format!("no pending request {id}"),
                    ))
                }
            }
        });
    }

    /// Send `request` through the tunnel. Resolves with the downstream
    /// response, or fails on timeout or when `cancel` fires.
    pub async fn send_with_cancel(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TetherError> {
        let request_id = mint_id();
        let body = compress(&request.body)?;
        let (request_headers, content_headers) = request.headers.split_content();

        let mut header = TunnelRequestHeader {
            method: request.method,
            uri: request.uri,
            request_headers,
            content_headers,
            body_length: body.len() as u64,
            // Widest value, so the real header is never longer than the measured one.
            chunks: u32::MAX,
        };

        let limit = self.events.max_payload_size();
        let measured = serde_json::to_vec(&header)?.len() + FRAME_PREFIX_LEN;
        check_limit(measured, limit)?;

        let room = limit - measured;
        let (head, tail) = body.split_at(room.min(body.len()));
        let rest = split(tail, limit);
        header.chunks = u32::try_from(chunk_count(tail.len(), limit))
            .map_err(|_| TetherError::Protocol("request body has too many chunks".into()))?;

        let frame = wire::encode_first_frame(&serde_json::to_vec(&header)?, head);

        tracing::debug!(
            request_id,
            method = %header.method,
            uri = header.uri,
            body = body.len(),
            chunks = header.chunks,
            "tunnelling request"
        );

        // Register first so a fast response cannot arrive before its waiter.
        let waiter = self.pending.register(&request_id)?;

        self.publish(&request_id, 0, Bytes::from(frame)).await?;
        for (i, slice) in rest.into_iter().enumerate() {
            self.publish(&request_id, i as u32 + 1, Bytes::copy_from_slice(slice))
                .await?;
        }

        let response = waiter.wait(self.request_timeout, cancel).await.map_err(|e| {
            tracing::warn!(request_id, error = %e, "tunnelled request did not complete");
            e
        })?;

        let body = decompress(&response.body)?;
        tracing::debug!(request_id, status = response.status, bytes = body.len(), "tunnelled request complete");
        Ok(HttpResponse {
            status: response.status,
            headers: response.headers,
            body: Bytes::from(body),
        })
    }

    async fn publish(&self, request_id: &str, sequence: u32, payload: Bytes) -> Result<(), TetherError> {
        let tag = EventTag::new(request_id, sequence).to_string();
        self.events
            .publish(payload, &tag, TUNNEL_REQUEST_SCHEMA, &tag)
            .await
            .map_err(|e| {
                tracing::warn!(request_id, sequence, error = %e, "tunnel publish failed");
                e
            })
    }
}

impl HttpClient for HttpTunnelClient {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TetherError>> {
        Box::pin(async move {
            self.send_with_cancel(request, &CancellationToken::new())
                .await
        })
    }
}
