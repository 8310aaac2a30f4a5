//! Chunk client — the calling half of the chunked call-channel RPC.
//!
//! Any payload is compressed and sent as a sequence of `$chunk` calls, each
//! small enough for the transport. The reply to the final upload chunk is
//! already the first download chunk; the rest is fetched with handle-only
//! polls until a terminal chunk arrives.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::compress::{compress, decompress};
use tether_core::sequencer::{split, Reassembler};
use tether_core::wire::{self, status, MethodChunk, CHUNK_OPERATION, JSON_CONTENT_TYPE};
use tether_core::TetherError;

use crate::transport::{check_limit, CallTransport};

/// Chunked RPC over a [`CallTransport`]. Cheap to clone.
#[derive(Clone)]
pub struct ChunkMethodClient {
    transport: Arc<dyn CallTransport>,
    default_timeout: Duration,
}

impl ChunkMethodClient {
    pub fn new(transport: Arc<dyn CallTransport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            default_timeout,
        }
    }

    /// Largest slice of compressed payload placed in one envelope.
    pub fn max_chunk_length(&self) -> usize {
        wire::max_chunk_length(self.transport.max_payload_size())
    }

    pub async fn call(
        &self,
        target: &str,
        operation: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<Bytes, TetherError> {
        self.call_with_timeout(target, operation, payload, content_type, self.default_timeout)
            .await
    }

    /// Run one chunked call. `timeout` bounds the whole exchange, not each round trip.
    pub async fn call_with_timeout(
        &self,
        target: &str,
        operation: &str,
        payload: &[u8],
        content_type: &str,
        timeout: Duration,
    ) -> Result<Bytes, TetherError> {
        let exchange = self.exchange(target, operation, payload, content_type, timeout);
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(peer = target, operation, ?timeout, "chunked call timed out");
                Err(TetherError::Timeout(timeout))
            }
        }
    }

    /// Call with a JSON request and decode the JSON reply.
    pub async fn call_json<Req, Resp>(
        &self,
        target: &str,
        operation: &str,
        request: &Req,
    ) -> Result<Resp, TetherError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)?;
        let reply = self.call(target, operation, &payload, JSON_CONTENT_TYPE).await?;
        let body: &[u8] = if reply.is_empty() { b"null" } else { &reply };
        Ok(serde_json::from_slice(body)?)
    }

    async fn exchange(
        &self,
        target: &str,
        operation: &str,
        payload: &[u8],
        content_type: &str,
        timeout: Duration,
    ) -> Result<Bytes, TetherError> {
        let body = compress(payload)?;
        let max = self.max_chunk_length();
        let mut parts = split(&body, max);
        if parts.is_empty() {
            parts.push(&[]);
        }

        tracing::debug!(
            peer = target,
            operation,
            bytes = payload.len(),
            compressed = body.len(),
            chunks = parts.len(),
            "starting chunked call"
        );

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let first = MethodChunk::first(
            operation,
            content_type,
            body.len(),
            max,
            Some(timeout_ms),
            Bytes::copy_from_slice(parts[0]),
        );
        let mut sequence = 0u32;
        let mut reply = self.round_trip(target, &first, timeout).await?;

        // Upload. A terminal reply before the last part means the server gave up.
        for part in &parts[1..] {
            let Some(handle) = reply.handle.clone() else {
                break;
            };
            sequence += 1;
            let chunk = MethodChunk::upload(&handle, sequence, Bytes::copy_from_slice(part));
            reply = self.round_trip(target, &chunk, timeout).await?;
        }

        // Download. A reply declaring a total length starts the body afresh,
        // which is how a mid-stream error replaces a partial result.
        let mut download: Option<Reassembler> = None;
        loop {
            if let Some(total) = reply.total_length {
                let total = usize::try_from(total).map_err(|_| TetherError::BodyTooLarge {
                    size: total,
                    limit: usize::MAX,
                })?;
                download = Some(Reassembler::new(total));
            }
            let assembler = download.as_mut().ok_or_else(|| {
                TetherError::Protocol("download chunk without total length".into())
            })?;
            assembler.append(reply.payload.as_deref().unwrap_or_default())?;

            let Some(handle) = reply.handle.clone() else {
                break;
            };
            sequence += 1;
            reply = self
                .round_trip(target, &MethodChunk::poll(&handle, sequence), timeout)
                .await?;
        }

        let assembler = download
            .ok_or_else(|| TetherError::Protocol("exchange ended without a result".into()))?;
        if !assembler.is_complete() {
            return Err(TetherError::Protocol(format!(
                "result truncated at {} of {} bytes",
                assembler.received(),
                assembler.total()
            )));
        }
        let result = decompress(&assembler.into_inner())?;

        let code = reply.status.unwrap_or(status::OK);
        if !status::is_success(code) {
            let body = String::from_utf8_lossy(&result).into_owned();
            tracing::debug!(peer = target, operation, status = code, "chunked call failed remotely");
            return Err(TetherError::RemoteStatus { status: code, body });
        }

        tracing::debug!(peer = target, operation, round_trips = sequence + 1, "chunked call complete");
        Ok(Bytes::from(result))
    }

    async fn round_trip(
        &self,
        target: &str,
        chunk: &MethodChunk,
        timeout: Duration,
    ) -> Result<MethodChunk, TetherError> {
        let envelope = Bytes::from(chunk.to_vec()?);
        check_limit(envelope.len(), self.transport.max_payload_size())?;

        let raw = self
            .transport
            .invoke(target, CHUNK_OPERATION, envelope, JSON_CONTENT_TYPE, timeout)
            .await?;
        let reply = MethodChunk::from_slice(&raw)?;
        if reply.sequence != chunk.sequence {
            return Err(TetherError::Protocol(format!(
                "reply for chunk {} answered chunk {}",
                reply.sequence, chunk.sequence
            )));
        }
        Ok(reply)
    }
}
