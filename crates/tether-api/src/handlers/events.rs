//! /events — inbound event primitive.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tether_core::wire::headers;
use tether_services::EventMessage;

use super::{error_response, required_header, ApiState};

/// Files the message with the tunnel server and answers 202 straight away.
/// A completed request is dispatched on its own task.
pub async fn handle_event(
    State(state): State<ApiState>,
    request_headers: HeaderMap,
    payload: Bytes,
) -> Response {
    let event = match event_from(&request_headers, payload) {
        Ok(event) => event,
        Err(rejection) => return rejection.into_response(),
    };

    match state.tunnel_server.accept(&event) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::warn!(id = %event.id, source = %event.source, error = %e, "event rejected");
            error_response(&e)
        }
    }
}

fn event_from(request_headers: &HeaderMap, payload: Bytes) -> Result<EventMessage, (StatusCode, String)> {
    Ok(EventMessage {
        source: required_header(request_headers, headers::SOURCE)?.to_string(),
        id: required_header(request_headers, headers::MESSAGE_ID)?.to_string(),
        schema: required_header(request_headers, headers::SCHEMA)?.to_string(),
        content_type: required_header(request_headers, CONTENT_TYPE.as_str())?.to_string(),
        payload,
    })
}
