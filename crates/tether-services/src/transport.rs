//! Transport primitives — the size-bounded channel between two peers.
//!
//! Both protocols are written against these two traits. The call primitive
//! is a synchronous request/reply with a hard payload ceiling; the event
//! primitive is one-way publish with a comparable ceiling.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tether_core::TetherError;

/// Synchronous call primitive.
pub trait CallTransport: Send + Sync {
    /// Largest payload accepted in one call, in either direction.
    fn max_payload_size(&self) -> usize;

    /// Invoke `operation` on `target`. A non-success reply surfaces as
    /// [`TetherError::RemoteStatus`].
    fn invoke<'a>(
        &'a self,
        target: &'a str,
        operation: &'a str,
        payload: Bytes,
        content_type: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Bytes, TetherError>>;
}

/// One-way publish primitive.
pub trait EventTransport: Send + Sync {
    fn max_payload_size(&self) -> usize;

    /// Hand one message to the channel. Returns once accepted, not delivered.
    fn publish<'a>(
        &'a self,
        payload: Bytes,
        id: &'a str,
        schema: &'a str,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<(), TetherError>>;
}

/// A published message as seen by the receiving peer.
#[derive(Debug, Clone)]
pub struct EventMessage {
    /// Identity of the publishing peer.
    pub source: String,
    pub id: String,
    pub schema: String,
    pub content_type: String,
    pub payload: Bytes,
}

/// Reject payloads that do not fit the channel. Never truncates.
pub fn check_limit(size: usize, limit: usize) -> Result<(), TetherError> {
    if size > limit {
        return Err(TetherError::TransportLimit { size, limit });
    }
    Ok(())
}
