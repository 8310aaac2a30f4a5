//! Method router — maps call-channel operation names to handlers.
//!
//! Plain calls go straight to the registered handler. Calls to
//! [`CHUNK_OPERATION`] are handed to the chunk server, which reassembles the
//! real call and comes back here to invoke the handler.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::wire::{status, CHUNK_OPERATION};
use tether_core::TetherError;

use crate::chunk_server::ChunkMethodServer;

// ── Handler contract ──────────────────────────────────────────────────────────

/// A fully reassembled call.
#[derive(Debug, Clone)]
pub struct MethodRequest {
    pub operation: String,
    pub content_type: String,
    pub payload: Bytes,
}

/// Outcome of a call as it travels back over the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResponse {
    pub status: u16,
    pub payload: Bytes,
}

impl MethodResponse {
    pub fn ok(payload: Bytes) -> Self {
        Self {
            status: status::OK,
            payload,
        }
    }

    /// Non-success response with a JSON `{ "message": ... }` body.
    pub fn error(status: u16, message: impl std::fmt::Display) -> Self {
        let body = serde_json::json!({ "message": message.to_string() });
        Self {
            status,
            payload: Bytes::from(body.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        status::is_success(self.status)
    }
}

/// Handler failure.
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    /// Deliberate non-success result. Status and body cross the channel verbatim.
    #[error("status {status}")]
    Status { status: u16, body: Bytes },
    /// Anything unexpected. Logged and answered with an internal-error status.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MethodError {
    pub fn status(status: u16, message: impl std::fmt::Display) -> Self {
        let response = MethodResponse::error(status, message);
        MethodError::Status {
            status,
            body: response.payload,
        }
    }

    pub fn bad_request(message: impl std::fmt::Display) -> Self {
        Self::status(status::BAD_REQUEST, message)
    }
}

pub trait MethodHandler: Send + Sync {
    fn invoke(&self, request: MethodRequest) -> BoxFuture<'static, Result<Bytes, MethodError>>;
}

// ── Typed adapters ────────────────────────────────────────────────────────────

struct RawHandler<F>(F);

impl<F, Fut> MethodHandler for RawHandler<F>
where
    F: Fn(MethodRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes, MethodError>> + Send + 'static,
{
    fn invoke(&self, request: MethodRequest) -> BoxFuture<'static, Result<Bytes, MethodError>> {
        Box::pin((self.0)(request))
    }
}

struct JsonHandler<F, Req, Resp> {
    f: F,
    _types: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<F, Fut, Req, Resp> MethodHandler for JsonHandler<F, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, MethodError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    fn invoke(&self, request: MethodRequest) -> BoxFuture<'static, Result<Bytes, MethodError>> {
        let body: &[u8] = if request.payload.is_empty() {
            b"null"
        } else {
            &request.payload
        };
        let decoded = match serde_json::from_slice::<Req>(body) {
            Ok(v) => v,
            Err(e) => {
                let operation = request.operation;
                return Box::pin(async move {
                    Err(MethodError::bad_request(format!(
                        "invalid payload for {operation}: {e}"
                    )))
                });
            }
        };
        let fut = (self.f)(decoded);
        Box::pin(async move {
            let response = fut.await?;
            let bytes = serde_json::to_vec(&response).map_err(anyhow::Error::from)?;
            Ok(Bytes::from(bytes))
        })
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

struct RouterInner {
    handlers: DashMap<String, Arc<dyn MethodHandler>>,
    /// Ceiling for a single direct call payload.
    max_payload: usize,
    chunks: OnceLock<Arc<ChunkMethodServer>>,
}

/// Operation name → handler. Cheap to clone.
#[derive(Clone)]
pub struct MethodRouter {
    inner: Arc<RouterInner>,
}

impl MethodRouter {
    pub fn new(max_payload: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                handlers: DashMap::new(),
                max_payload,
                chunks: OnceLock::new(),
            }),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.inner.max_payload
    }

    /// Register a handler. Replaces an existing registration of the same name.
    pub fn register(&self, operation: &str, handler: Arc<dyn MethodHandler>) {
        if self
            .inner
            .handlers
            .insert(operation.to_string(), handler)
            .is_some()
        {
            tracing::warn!(operation, "replaced existing method handler");
        }
    }

    /// Register a handler working on raw bytes.
    pub fn register_raw<F, Fut>(&self, operation: &str, f: F)
    where
        F: Fn(MethodRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, MethodError>> + Send + 'static,
    {
        self.register(operation, Arc::new(RawHandler(f)));
    }

    /// Register a handler taking and returning JSON values.
    /// An undecodable request is answered with 400.
    pub fn register_json<Req, Resp, F, Fut>(&self, operation: &str, f: F)
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, MethodError>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.register(
            operation,
            Arc::new(JsonHandler {
                f,
                _types: std::marker::PhantomData,
            }),
        );
    }

    pub fn is_registered(&self, operation: &str) -> bool {
        (operation == CHUNK_OPERATION && self.inner.chunks.get().is_some())
            || self.inner.handlers.contains_key(operation)
    }

    /// Attach the chunk server that answers [`CHUNK_OPERATION`].
    pub fn attach_chunk_server(&self, server: Arc<ChunkMethodServer>) -> Result<(), TetherError> {
        self.inner
            .chunks
            .set(server)
            .map_err(|_| TetherError::DuplicateExchange(CHUNK_OPERATION.to_string()))
    }

    pub fn chunk_server(&self) -> Option<&Arc<ChunkMethodServer>> {
        self.inner.chunks.get()
    }

    /// Entry point of the call primitive on the receiving peer.
    pub async fn invoke(
        &self,
        operation: &str,
        payload: Bytes,
        content_type: &str,
    ) -> Result<MethodResponse, TetherError> {
        if payload.len() > self.inner.max_payload {
            tracing::warn!(
                operation,
                size = payload.len(),
                limit = self.inner.max_payload,
                "call payload exceeds channel limit"
            );
            return Ok(MethodResponse::error(
                status::PAYLOAD_TOO_LARGE,
                format!(
                    "payload of {} bytes exceeds limit of {} bytes",
                    payload.len(),
                    self.inner.max_payload
                ),
            ));
        }

        if operation == CHUNK_OPERATION {
            if let Some(server) = self.inner.chunks.get() {
                return Ok(server.handle(self, &payload).await);
            }
        }

        let request = MethodRequest {
            operation: operation.to_string(),
            content_type: content_type.to_string(),
            payload,
        };
        self.dispatch(request).await
    }

    /// Run the registered handler for an already reassembled call.
    pub async fn dispatch(&self, request: MethodRequest) -> Result<MethodResponse, TetherError> {
        let handler = self
            .inner
            .handlers
            .get(&request.operation)
            .map(|h| h.value().clone())
            .ok_or_else(|| TetherError::NotRegistered(request.operation.clone()))?;

        let operation = request.operation.clone();
        match handler.invoke(request).await {
            Ok(payload) => Ok(MethodResponse::ok(payload)),
            Err(MethodError::Status { status, body }) => {
                tracing::debug!(operation, status, "handler returned status");
                Ok(MethodResponse {
                    status,
                    payload: body,
                })
            }
            Err(MethodError::Internal(e)) => {
                tracing::error!(operation, error = %e, "method handler failed");
                Ok(MethodResponse::error(status::INTERNAL_ERROR, e))
            }
        }
    }
}
