//! Chunk server — the receiving half of the chunked call-channel RPC.
//!
//! Exchange lifecycle: the first chunk opens an exchange, upload chunks are
//! appended in order, the completed upload is dispatched to the registered
//! handler, and the compressed result is drained back one chunk per call.
//! An exchange sits in the registry only while it waits for the next call,
//! so the idle sweep never evicts a handler that is still running.
//!
//! Every download body is gzip, error bodies included.

use std::time::Duration;

use bytes::Bytes;
use tether_core::compress::{compress, decompress};
use tether_core::config::RpcSettings;
use tether_core::sequencer::Reassembler;
use tether_core::wire::{self, mint_id, status, MethodChunk, CHUNK_OPERATION};
use tether_core::TetherError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::registry::ExchangeRegistry;
use crate::router::{MethodRequest, MethodResponse, MethodRouter};

enum Phase {
    /// Receiving the compressed request.
    Upload(Reassembler),
    /// Handler running; the exchange is out of the registry.
    Dispatching,
    /// Returning the compressed result.
    Download { body: Bytes, offset: usize, status: u16 },
}

struct ChunkExchange {
    operation: String,
    content_type: String,
    max_chunk_length: usize,
    timeout: Duration,
    next_sequence: u32,
    phase: Phase,
}

pub struct ChunkMethodServer {
    exchanges: ExchangeRegistry<ChunkExchange>,
    exchange_timeout: Duration,
    max_exchange_timeout: Duration,
    max_body_length: usize,
    sweep_interval: Duration,
}

impl ChunkMethodServer {
    pub fn new(settings: &RpcSettings) -> Self {
        Self {
            exchanges: ExchangeRegistry::new("rpc"),
            exchange_timeout: settings.exchange_timeout(),
            max_exchange_timeout: settings.max_exchange_timeout(),
            max_body_length: settings.max_body_length,
            sweep_interval: settings.sweep_interval(),
        }
    }

    /// Exchanges currently waiting for their next chunk.
    pub fn in_flight(&self) -> usize {
        self.exchanges.len()
    }

    pub fn spawn_sweeper(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        self.exchanges.spawn_sweeper(self.sweep_interval, shutdown)
    }

    /// Evict idle exchanges now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.exchanges.sweep()
    }

    /// Drop all exchanges.
    pub fn shutdown(&self) {
        self.exchanges.clear();
    }

    /// Answer one `$chunk` call. Failures travel back as a terminal envelope.
    pub async fn handle(&self, router: &MethodRouter, payload: &[u8]) -> MethodResponse {
        let request = match MethodChunk::from_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "malformed chunk envelope");
                return MethodResponse::error(status::BAD_REQUEST, e);
            }
        };

        let sequence = request.sequence;
        let reply = match self.step(router, request).await {
            Ok(reply) => reply,
            Err(e) => {
                let message = MethodResponse::error(e.status(), &e).payload;
                let body = compress(&message).map(Bytes::from).unwrap_or_default();
                MethodChunk::terminal(sequence, e.status(), body)
            }
        };

        match reply.to_vec() {
            Ok(bytes) => MethodResponse::ok(Bytes::from(bytes)),
            Err(e) => MethodResponse::error(status::INTERNAL_ERROR, e),
        }
    }

    async fn step(
        &self,
        router: &MethodRouter,
        request: MethodChunk,
    ) -> Result<MethodChunk, TetherError> {
        let (handle, mut exchange) = match &request.handle {
            None => (mint_id(), self.open(router, &request)?),
            Some(handle) => match self.exchanges.remove(handle) {
                Some(exchange) => (handle.clone(), exchange),
                None => {
                    tracing::warn!(handle, sequence = request.sequence, "chunk for unknown exchange, dropping");
                    return Err(TetherError::UnknownExchange(handle.clone()));
                }
            },
        };

        if request.sequence != exchange.next_sequence {
            tracing::warn!(
                handle,
                expected = exchange.next_sequence,
                got = request.sequence,
                "out of order chunk, abandoning exchange"
            );
            return Err(TetherError::Protocol(format!(
                "expected chunk {} but received {}",
                exchange.next_sequence, request.sequence
            )));
        }
        exchange.next_sequence += 1;

        let upload_complete = match &mut exchange.phase {
            Phase::Upload(reassembler) => {
                let chunk = request.payload.unwrap_or_default();
                let done = reassembler.append(&chunk)?;
                tracing::trace!(
                    handle,
                    sequence = request.sequence,
                    received = reassembler.received(),
                    total = reassembler.total(),
                    "upload chunk"
                );
                Some(done)
            }
            Phase::Download { .. } => None,
            Phase::Dispatching => {
                return Err(TetherError::Protocol("exchange is still dispatching".into()));
            }
        };

        match upload_complete {
            Some(false) => {
                let reply = MethodChunk::accepted(&handle, request.sequence);
                self.park(handle, exchange)?;
                Ok(reply)
            }
            Some(true) => {
                let Phase::Upload(reassembler) =
                    std::mem::replace(&mut exchange.phase, Phase::Dispatching)
                else {
                    return Err(TetherError::Protocol("upload state lost".into()));
                };
                exchange.phase = self.dispatch(router, &handle, &exchange, reassembler).await;
                self.drain(handle, exchange, request.sequence)
            }
            None => self.drain(handle, exchange, request.sequence),
        }
    }

    /// Validate a first chunk and build its exchange.
    fn open(&self, router: &MethodRouter, request: &MethodChunk) -> Result<ChunkExchange, TetherError> {
        let operation = request
            .operation
            .clone()
            .ok_or_else(|| TetherError::Protocol("first chunk without operation".into()))?;
        if operation == CHUNK_OPERATION {
            return Err(TetherError::Protocol("nested chunk operation".into()));
        }
        if !router.is_registered(&operation) {
            return Err(TetherError::NotRegistered(operation));
        }

        let declared = request
            .total_length
            .ok_or_else(|| TetherError::Protocol("first chunk without total length".into()))?;
        let total = usize::try_from(declared)
            .ok()
            .filter(|total| *total <= self.max_body_length)
            .ok_or(TetherError::BodyTooLarge {
                size: declared,
                limit: self.max_body_length,
            })?;
        let ceiling = wire::max_chunk_length(router.max_payload());
        let max_chunk_length = request.max_chunk_length.unwrap_or(0) as usize;
        if max_chunk_length == 0 || max_chunk_length > ceiling {
            return Err(TetherError::Protocol(format!(
                "max chunk length {max_chunk_length} outside 1..={ceiling}"
            )));
        }

        let timeout = request
            .timeout_ms
            .map(|ms| Duration::from_millis(ms).min(self.max_exchange_timeout))
            .unwrap_or(self.exchange_timeout);

        tracing::debug!(operation, total, max_chunk_length, "opening chunked exchange");

        Ok(ChunkExchange {
            operation,
            content_type: request
                .content_type
                .clone()
                .unwrap_or_else(|| wire::JSON_CONTENT_TYPE.to_string()),
            max_chunk_length,
            timeout,
            next_sequence: 0,
            phase: Phase::Upload(Reassembler::new(total)),
        })
    }

    /// Invoke the handler with the reassembled request; never fails.
    async fn dispatch(
        &self,
        router: &MethodRouter,
        handle: &str,
        exchange: &ChunkExchange,
        upload: Reassembler,
    ) -> Phase {
        let response = match decompress(&upload.into_inner()) {
            Ok(payload) => {
                let request = MethodRequest {
                    operation: exchange.operation.clone(),
                    content_type: exchange.content_type.clone(),
                    payload: Bytes::from(payload),
                };
                match router.dispatch(request).await {
                    Ok(response) => response,
                    Err(e) => MethodResponse::error(e.status(), e),
                }
            }
            Err(e) => {
                tracing::warn!(handle, error = %e, "uploaded payload failed to decompress");
                MethodResponse::error(status::BAD_REQUEST, e)
            }
        };

        let code = response.status;
        match compress(&response.payload) {
            Ok(body) => {
                tracing::debug!(
                    handle,
                    operation = %exchange.operation,
                    status = code,
                    bytes = body.len(),
                    "dispatched chunked call"
                );
                Phase::Download {
                    body: Bytes::from(body),
                    offset: 0,
                    status: code,
                }
            }
            Err(e) => {
                tracing::error!(handle, error = %e, "failed to compress result");
                Phase::Download {
                    body: Bytes::new(),
                    offset: 0,
                    status: status::INTERNAL_ERROR,
                }
            }
        }
    }

    /// Return the next download slice; park the exchange again if more remain.
    fn drain(
        &self,
        handle: String,
        mut exchange: ChunkExchange,
        sequence: u32,
    ) -> Result<MethodChunk, TetherError> {
        let max = exchange.max_chunk_length;
        let Phase::Download { body, offset, status } = &mut exchange.phase else {
            return Err(TetherError::Protocol("exchange has nothing to download".into()));
        };

        let first = *offset == 0;
        let end = (*offset + max).min(body.len());
        let mut reply = MethodChunk {
            sequence,
            payload: Some(body.slice(*offset..end)),
            total_length: first.then_some(body.len() as u64),
            ..Default::default()
        };
        *offset = end;

        if end == body.len() {
            reply.status = Some(*status);
            tracing::debug!(handle, status = *status, "exchange drained");
            return Ok(reply);
        }

        reply.handle = Some(handle.clone());
        self.park(handle, exchange)?;
        Ok(reply)
    }

    fn park(&self, handle: String, exchange: ChunkExchange) -> Result<(), TetherError> {
        let timeout = exchange.timeout;
        self.exchanges.insert(handle, exchange, timeout)
    }
}
