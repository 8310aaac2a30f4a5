//! HTTP implementations of the call and event primitives between two daemons.
//!
//! Each daemon exposes `/api/call` and `/api/events`; these transports are
//! the sending side. Both enforce the configured ceiling before anything
//! leaves the process.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tether_core::wire::{headers, status};
use tether_core::TetherError;
use tether_services::transport::check_limit;
use tether_services::{CallTransport, EventTransport};

fn client() -> Result<reqwest::Client, TetherError> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| TetherError::Transport(e.to_string()))
}

fn send_error(url: &str, timeout: Option<Duration>, e: reqwest::Error) -> TetherError {
    match timeout {
        Some(t) if e.is_timeout() => TetherError::Timeout(t),
        _ => TetherError::Transport(format!("{url}: {e}")),
    }
}

/// Non-success replies carry the remote status and best-effort body text.
async fn read_reply(url: &str, response: reqwest::Response) -> Result<Bytes, TetherError> {
    let code = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|e| send_error(url, None, e))?;
    if !status::is_success(code) {
        return Err(TetherError::RemoteStatus {
            status: code,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(body)
}

// ── Call primitive ────────────────────────────────────────────────────────────

pub struct HttpCallTransport {
    client: reqwest::Client,
    url: String,
    max_payload: usize,
}

impl HttpCallTransport {
    pub fn new(peer_url: &str, max_payload: usize) -> Result<Self, TetherError> {
        Ok(Self {
            client: client()?,
            url: format!("{}/api/call", peer_url.trim_end_matches('/')),
            max_payload,
        })
    }
}

impl CallTransport for HttpCallTransport {
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
            tracing::trace!(peer = target, operation, bytes = payload.len(), "outbound call");

            let response = self
                .client
                .post(&self.url)
                .header(headers::OPERATION, operation)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .timeout(timeout)
                .body(payload)
                .send()
                .await
                .map_err(|e| send_error(&self.url, Some(timeout), e))?;

            let body = read_reply(&self.url, response).await?;
            check_limit(body.len(), self.max_payload)?;
            Ok(body)
        })
    }
}

// ── Event primitive ───────────────────────────────────────────────────────────

pub struct HttpEventTransport {
    client: reqwest::Client,
    url: String,
    /// This daemon's identity, sent so the receiver knows whom to call back.
    source: String,
    max_payload: usize,
}

impl HttpEventTransport {
    pub fn new(peer_url: &str, source: &str, max_payload: usize) -> Result<Self, TetherError> {
        Ok(Self {
            client: client()?,
            url: format!("{}/api/events", peer_url.trim_end_matches('/')),
            source: source.to_string(),
            max_payload,
        })
    }
}

impl EventTransport for HttpEventTransport {
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

            let response = self
                .client
                .post(&self.url)
                .header(headers::SOURCE, &self.source)
                .header(headers::MESSAGE_ID, id)
                .header(headers::SCHEMA, schema)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(payload)
                .send()
                .await
                .map_err(|e| send_error(&self.url, None, e))?;

            read_reply(&self.url, response).await.map(|_| ())
        })
    }
}
