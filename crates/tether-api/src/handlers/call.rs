//! /call — inbound call primitive.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderMap};
use axum::response::{IntoResponse, Response};
use tether_core::wire::{headers, JSON_CONTENT_TYPE};

use super::{error_response, header, required_header, status_code, ApiState};

pub async fn handle_call(
    State(state): State<ApiState>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Response {
    let operation = match required_header(&request_headers, headers::OPERATION) {
        Ok(op) => op.to_string(),
        Err(rejection) => return rejection.into_response(),
    };
    let content_type = header(&request_headers, CONTENT_TYPE.as_str()).unwrap_or(JSON_CONTENT_TYPE);

    match state.router.invoke(&operation, body, content_type).await {
        Ok(response) => (
            status_code(response.status),
            [(CONTENT_TYPE, JSON_CONTENT_TYPE)],
            response.payload,
        )
            .into_response(),
        Err(e) => {
            tracing::debug!(operation, error = %e, "call rejected");
            error_response(&e)
        }
    }
}
