//! /proxy/{*path} — forward any request through the HTTP tunnel to the peer.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use tether_core::{HttpMethod, HttpRequest};
use tether_services::HttpClient;

use super::{error_response, status_code, ApiState};

pub async fn handle_proxy(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    request_headers: HeaderMap,
    body: Bytes,
) -> Response {
    let method: HttpMethod = match method.as_str().parse() {
        Ok(m) => m,
        Err(e) => return error_response(&e),
    };
    let target = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .strip_prefix("/proxy")
        .unwrap_or("/")
        .to_string();

    let mut request = HttpRequest::new(method, target).with_body(body);
    for (name, value) in &request_headers {
        if let Ok(v) = value.to_str() {
            request.headers.append(name.as_str(), v);
        }
    }

    match state.tunnel_client.send(request).await {
        Ok(response) => {
            let mut builder = Response::builder().status(status_code(response.status));
            for (name, value) in response.headers.iter() {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(response.body))
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "unusable tunnelled response");
                    axum::http::StatusCode::BAD_GATEWAY.into_response()
                })
        }
        Err(e) => {
            tracing::warn!(%method, uri = %uri, error = %e, "proxied request failed");
            error_response(&e)
        }
    }
}
