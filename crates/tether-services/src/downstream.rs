//! Downstream HTTP — the one seam both tunnel ends are written against.
//!
//! The tunnel server forwards reassembled requests through an [`HttpClient`];
//! the tunnel client is itself an [`HttpClient`], so callers cannot tell a
//! tunnelled request from a direct one.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tether_core::{HeaderMap, HttpMethod, HttpRequest, HttpResponse, TetherError};

pub trait HttpClient: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TetherError>>;
}

/// Hop-by-hop or length headers that the outgoing client recomputes.
const SKIPPED_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding", "connection"];

fn skipped(name: &str) -> bool {
    SKIPPED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// [`HttpClient`] backed by `reqwest`. Relative URIs resolve against `base_url`.
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ReqwestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TetherError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TetherError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve(&self, uri: &str) -> String {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return uri.to_string();
        }
        format!("{}/{}", self.base_url, uri.trim_start_matches('/'))
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TetherError> {
        let url = self.resolve(&request.uri);
        let mut builder = self.client.request(method(request.method), &url);
        for (name, value) in request.headers.iter().filter(|(n, _)| !skipped(n)) {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TetherError::Timeout(self.timeout)
            } else {
                TetherError::Transport(format!("{url}: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if skipped(name.as_str()) {
                continue;
            }
            match value.to_str() {
                Ok(v) => headers.append(name.as_str(), v),
                Err(_) => tracing::debug!(header = %name, "dropping non-ascii response header"),
            }
        }
        let body: Bytes = response
            .bytes()
            .await
            .map_err(|e| TetherError::Transport(e.to_string()))?;

        tracing::debug!(%url, status, bytes = body.len(), "downstream request complete");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl HttpClient for ReqwestClient {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TetherError>> {
        Box::pin(self.execute(request))
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}
