//! HTTP tunnel server — reassembles tunnelled requests from event messages,
//! runs them against the real downstream and calls the requester back.
//!
//! Ingest is synchronous: it files each message into its exchange and hands
//! back a [`ReadyRequest`] once every slot is filled. Dispatch is the only
//! async part. Keeping the two apart lets a transport feed messages in
//! arrival order while downstream calls run concurrently.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tether_core::compress::{compress, decompress};
use tether_core::config::TunnelSettings;
use tether_core::sequencer::{chunk_count, SlotAssembler};
use tether_core::wire::{
    self, status, EventTag, TunnelRequestHeader, TunnelResponse, JSON_CONTENT_TYPE,
    TUNNEL_REQUEST_SCHEMA, TUNNEL_RESPONSE_OPERATION,
};
use tether_core::{HttpRequest, TetherError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::chunk_client::ChunkMethodClient;
use crate::downstream::HttpClient;
use crate::registry::ExchangeRegistry;
use crate::transport::EventMessage;

struct TunnelExchange {
    header: TunnelRequestHeader,
    source: String,
    head: Bytes,
    slots: SlotAssembler,
}

impl TunnelExchange {
    fn finish(self, request_id: String) -> ReadyRequest {
        let TunnelExchange {
            header,
            source,
            head,
            slots,
        } = self;
        ReadyRequest {
            request_id,
            source,
            request: rebuild(header, &head, slots),
        }
    }
}

fn rebuild(
    header: TunnelRequestHeader,
    head: &[u8],
    slots: SlotAssembler,
) -> Result<HttpRequest, TetherError> {
    let body = slots
        .assemble(head)
        .ok_or_else(|| TetherError::Protocol("tunnel body has empty slots".into()))?;
    if body.len() as u64 != header.body_length {
        return Err(TetherError::Protocol(format!(
            "tunnel body is {} bytes, header declared {}",
            body.len(),
            header.body_length
        )));
    }
    let mut headers = header.request_headers;
    headers.extend(header.content_headers);
    Ok(HttpRequest {
        method: header.method,
        uri: header.uri,
        headers,
        body: Bytes::from(decompress(&body)?),
    })
}

/// A fully reassembled request, or the reason it could not be rebuilt.
#[derive(Debug)]
pub struct ReadyRequest {
    request_id: String,
    source: String,
    request: Result<HttpRequest, TetherError>,
}

impl ReadyRequest {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

pub struct HttpTunnelServer {
    exchanges: ExchangeRegistry<TunnelExchange>,
    downstream: Arc<dyn HttpClient>,
    callback: ChunkMethodClient,
    /// Event ceiling; the size of every body slice after the first message.
    max_event_payload: usize,
    max_body_length: usize,
    exchange_timeout: Duration,
    sweep_interval: Duration,
}

impl HttpTunnelServer {
    pub fn new(
        downstream: Arc<dyn HttpClient>,
        callback: ChunkMethodClient,
        max_event_payload: usize,
        settings: &TunnelSettings,
    ) -> Self {
        Self {
            exchanges: ExchangeRegistry::new("tunnel"),
            downstream,
            callback,
            max_event_payload,
            max_body_length: settings.max_body_length,
            exchange_timeout: settings.exchange_timeout(),
            sweep_interval: settings.sweep_interval(),
        }
    }

    /// Partial requests waiting for more body messages.
    pub fn in_flight(&self) -> usize {
        self.exchanges.len()
    }

    pub fn spawn_sweeper(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        self.exchanges.spawn_sweeper(self.sweep_interval, shutdown)
    }

    pub fn sweep(&self) -> usize {
        self.exchanges.sweep()
    }

    pub fn shutdown(&self) {
        self.exchanges.clear();
    }

    /// Ingest one message and, if it completed a request, dispatch it on a
    /// spawned task.
    pub fn accept(self: &Arc<Self>, event: &EventMessage) -> Result<(), TetherError> {
        if let Some(ready) = self.ingest(event)? {
            let server = Arc::clone(self);
            tokio::spawn(async move { server.dispatch(ready).await });
        }
        Ok(())
    }

    /// Ingest then dispatch inline.
    pub async fn handle_event(&self, event: &EventMessage) -> Result<(), TetherError> {
        if let Some(ready) = self.ingest(event)? {
            self.dispatch(ready).await;
        }
        Ok(())
    }

    /// File one event message. Returns the request once it is complete.
    ///
    /// A continuation for an unknown request id is dropped, not an error:
    /// its exchange was evicted and the requester will time out on its own.
    pub fn ingest(&self, event: &EventMessage) -> Result<Option<ReadyRequest>, TetherError> {
        if event.schema != TUNNEL_REQUEST_SCHEMA {
            return Err(TetherError::Protocol(format!(
                "unexpected event schema {}",
                event.schema
            )));
        }
        let tag: EventTag = event.content_type.parse()?;
        if tag.sequence == 0 {
            return self.open(tag.request_id, event);
        }

        let request_id = tag.request_id;
        let index = tag.sequence as usize - 1;
        let filed = self.exchanges.update(&request_id, |exchange| {
            exchange.slots.insert(index, event.payload.clone())?;
            Ok::<_, TetherError>(exchange.slots.is_complete())
        });

        match filed {
            None => {
                tracing::warn!(request_id, sequence = tag.sequence, "continuation for unknown request, dropping");
                Ok(None)
            }
            Some(Err(e)) => {
                tracing::warn!(request_id, sequence = tag.sequence, error = %e, "bad continuation, abandoning request");
                Ok(self.exchanges.remove(&request_id).map(|exchange| ReadyRequest {
                    request_id,
                    source: exchange.source,
                    request: Err(e),
                }))
            }
            Some(Ok(false)) => Ok(None),
            // A concurrent duplicate of the last chunk may have taken it already.
            Some(Ok(true)) => Ok(self
                .exchanges
                .remove(&request_id)
                .map(|exchange| exchange.finish(request_id))),
        }
    }

    fn open(
        &self,
        request_id: String,
        event: &EventMessage,
    ) -> Result<Option<ReadyRequest>, TetherError> {
        let parsed = wire::decode_first_frame(&event.payload).and_then(|(header, head)| {
            let header: TunnelRequestHeader = serde_json::from_slice(header)?;
            self.check_shape(&header, head.len())?;
            Ok((header, Bytes::copy_from_slice(head)))
        });
        let (header, head) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(request_id, error = %e, "unreadable tunnel request header");
                return Ok(Some(ReadyRequest {
                    request_id,
                    source: event.source.clone(),
                    request: Err(e),
                }));
            }
        };

        tracing::debug!(
            request_id,
            method = %header.method,
            uri = %header.uri,
            chunks = header.chunks,
            "tunnel request opened"
        );

        let exchange = TunnelExchange {
            slots: SlotAssembler::new(header.chunks as usize),
            header,
            source: event.source.clone(),
            head,
        };
        if exchange.slots.is_complete() {
            return Ok(Some(exchange.finish(request_id)));
        }
        self.exchanges
            .insert(request_id, exchange, self.exchange_timeout)?;
        Ok(None)
    }

    /// The declared body must fit the configured limit, and the chunk count
    /// must be exactly what the bytes missing from the first message need.
    fn check_shape(&self, header: &TunnelRequestHeader, head_len: usize) -> Result<(), TetherError> {
        let body_length = usize::try_from(header.body_length)
            .ok()
            .filter(|len| *len <= self.max_body_length)
            .ok_or(TetherError::BodyTooLarge {
                size: header.body_length,
                limit: self.max_body_length,
            })?;
        let rest = body_length.checked_sub(head_len).ok_or_else(|| {
            TetherError::Protocol(format!(
                "first message carries {head_len} body bytes, header declared {body_length}"
            ))
        })?;
        let expected = chunk_count(rest, self.max_event_payload);
        if header.chunks as usize != expected {
            return Err(TetherError::Protocol(format!(
                "header declares {} chunks, {rest} remaining bytes need {expected}",
                header.chunks
            )));
        }
        Ok(())
    }

    /// Execute a ready request downstream and deliver the result to its
    /// requester. Every failure becomes a structured response.
    pub async fn dispatch(&self, ready: ReadyRequest) {
        let ReadyRequest {
            request_id,
            source,
            request,
        } = ready;

        let response = match request {
            Ok(request) => self.execute(&request_id, request).await,
            Err(e) => failure(&request_id, e.status(), &e),
        };

        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(request_id, error = %e, "failed to encode tunnel response");
                return;
            }
        };
        match self
            .callback
            .call(&source, TUNNEL_RESPONSE_OPERATION, &payload, JSON_CONTENT_TYPE)
            .await
        {
            Ok(_) => tracing::debug!(request_id, peer = %source, status = response.status, "tunnel response delivered"),
            Err(e) => tracing::warn!(request_id, peer = %source, error = %e, "failed to deliver tunnel response"),
        }
    }

    async fn execute(&self, request_id: &str, request: HttpRequest) -> TunnelResponse {
        let method = request.method;
        let uri = request.uri.clone();
        let outcome = match self.downstream.send(request).await {
            Ok(response) => compress(&response.body).map(|body| TunnelResponse {
                request_id: request_id.to_string(),
                status: response.status,
                headers: response.headers,
                body: Bytes::from(body),
            }),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(response) => {
                tracing::debug!(request_id, %method, uri, status = response.status, "downstream answered");
                response
            }
            Err(e) => {
                tracing::error!(request_id, %method, uri, error = %e, "tunnelled request failed");
                failure(request_id, status::INTERNAL_ERROR, &e)
            }
        }
    }
}

fn failure(request_id: &str, status: u16, error: &TetherError) -> TunnelResponse {
    let message = serde_json::json!({ "message": error.to_string() }).to_string();
    TunnelResponse {
        request_id: request_id.to_string(),
        status,
        headers: [("content-type", JSON_CONTENT_TYPE)].into_iter().collect(),
        body: compress(message.as_bytes())
            .map(Bytes::from)
            .unwrap_or_default(),
    }
}
