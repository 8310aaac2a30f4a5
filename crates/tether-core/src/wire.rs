//! Tether wire format — envelopes exchanged over the call and event channels.
//!
//! Envelopes are JSON. Binary payloads inside JSON are base64 encoded, which
//! is why the call channel only fills [`CHUNK_LENGTH_PERCENT`] of the channel
//! ceiling with raw payload bytes.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TetherError;
use crate::http::{HeaderMap, HttpMethod};

// ── Operation names and schemas ───────────────────────────────────────────────

/// Reserved call-channel operation carrying [`MethodChunk`] envelopes.
pub const CHUNK_OPERATION: &str = "$chunk";

/// Call-channel operation on the requesting peer that receives tunnel responses.
pub const TUNNEL_RESPONSE_OPERATION: &str = "$tunnel/response";

/// Event schema of tunnelled HTTP requests.
pub const TUNNEL_REQUEST_SCHEMA: &str = "application/x-tether-tunnel-request";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const OCTET_CONTENT_TYPE: &str = "application/octet-stream";

/// HTTP headers carrying primitive metadata between two daemons.
pub mod headers {
    pub const OPERATION: &str = "x-tether-operation";
    pub const MESSAGE_ID: &str = "x-tether-message-id";
    pub const SCHEMA: &str = "x-tether-schema";
    pub const SOURCE: &str = "x-tether-source";
}

/// Share of the call-channel ceiling available to raw payload bytes.
pub const CHUNK_LENGTH_PERCENT: usize = 66;

/// Largest raw payload slice per call-channel envelope for a channel ceiling.
pub fn max_chunk_length(channel_max_payload: usize) -> usize {
    channel_max_payload * CHUNK_LENGTH_PERCENT / 100
}

/// HTTP-like result codes used on the channel.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const PAYLOAD_TOO_LARGE: u16 = 413;
    pub const CLIENT_CLOSED_REQUEST: u16 = 499;
    pub const INTERNAL_ERROR: u16 = 500;
    pub const BAD_GATEWAY: u16 = 502;
    pub const GATEWAY_TIMEOUT: u16 = 504;

    pub fn is_success(code: u16) -> bool {
        (200..300).contains(&code)
    }
}

/// Mint an opaque exchange id: 16 random bytes, hex encoded.
pub fn mint_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

// ── Call-channel chunk envelope ───────────────────────────────────────────────

/// One message of a chunked call-channel exchange, in either direction.
///
/// The first upload chunk has no handle and declares `total_length`,
/// `max_chunk_length`, `operation` and `content_type`. Every later message
/// carries the handle the server minted. The terminal download chunk drops
/// the handle and carries `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default)]
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunk_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub payload: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl MethodChunk {
    /// First upload chunk of a new exchange.
    pub fn first(
        operation: &str,
        content_type: &str,
        total_length: usize,
        max_chunk_length: usize,
        timeout_ms: Option<u64>,
        payload: Bytes,
    ) -> Self {
        Self {
            operation: Some(operation.to_string()),
            content_type: Some(content_type.to_string()),
            total_length: Some(total_length as u64),
            max_chunk_length: Some(max_chunk_length as u32),
            timeout_ms,
            payload: Some(payload),
            ..Default::default()
        }
    }

    /// Follow-up upload chunk.
    pub fn upload(handle: &str, sequence: u32, payload: Bytes) -> Self {
        Self {
            handle: Some(handle.to_string()),
            sequence,
            payload: Some(payload),
            ..Default::default()
        }
    }

    /// Handle-only request asking for the next download chunk.
    pub fn poll(handle: &str, sequence: u32) -> Self {
        Self {
            handle: Some(handle.to_string()),
            sequence,
            ..Default::default()
        }
    }

    /// Server acknowledgement of an upload chunk that did not finish the upload.
    pub fn accepted(handle: &str, sequence: u32) -> Self {
        Self::poll(handle, sequence)
    }

    /// Terminal reply carrying only a status and a diagnostic body.
    pub fn terminal(sequence: u32, status: u16, payload: Bytes) -> Self {
        Self {
            sequence,
            total_length: Some(payload.len() as u64),
            payload: Some(payload),
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.handle.is_none()
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, TetherError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TetherError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ── Event-channel tag ─────────────────────────────────────────────────────────

/// `"{request_id}_{sequence}"`: identifies one event message of a tunnelled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTag {
    pub request_id: String,
    pub sequence: u32,
}

impl EventTag {
    pub fn new(request_id: &str, sequence: u32) -> Self {
        Self {
            request_id: request_id.to_string(),
            sequence,
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.request_id, self.sequence)
    }
}

impl FromStr for EventTag {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, seq) = s
            .rsplit_once('_')
            .ok_or_else(|| TetherError::InvalidTag(s.to_string()))?;
        if id.is_empty() {
            return Err(TetherError::InvalidTag(s.to_string()));
        }
        let sequence = seq
            .parse()
            .map_err(|_| TetherError::InvalidTag(s.to_string()))?;
        Ok(Self {
            request_id: id.to_string(),
            sequence,
        })
    }
}

// ── Tunnel request / response ─────────────────────────────────────────────────

/// Header envelope leading the first event message of a tunnelled request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequestHeader {
    pub method: HttpMethod,
    pub uri: String,
    #[serde(default)]
    pub request_headers: HeaderMap,
    #[serde(default)]
    pub content_headers: HeaderMap,
    /// Length of the compressed body across all messages.
    pub body_length: u64,
    /// Number of body messages following the first one.
    pub chunks: u32,
}

/// Result of a tunnelled request, returned through the call channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelResponse {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderMap,
    /// Compressed response body.
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
}

/// Bytes of length prefixes in the first tunnel message.
pub const FRAME_PREFIX_LEN: usize = 8;

/// Encode the first tunnel message: `u32 header len | header | u32 body len | body`.
pub fn encode_first_frame(header: &[u8], body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + header.len() + body.len());
    frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
    frame.extend_from_slice(header);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Split a first tunnel message into `(header, body slice)`.
pub fn decode_first_frame(frame: &[u8]) -> Result<(&[u8], &[u8]), TetherError> {
    let (header, rest) = read_prefixed(frame)?;
    let (body, trailing) = read_prefixed(rest)?;
    if !trailing.is_empty() {
        return Err(TetherError::Protocol(format!(
            "{} trailing bytes after tunnel frame",
            trailing.len()
        )));
    }
    Ok((header, body))
}

fn read_prefixed(buf: &[u8]) -> Result<(&[u8], &[u8]), TetherError> {
    let (prefix, rest) = buf
        .split_first_chunk::<4>()
        .ok_or_else(|| TetherError::Protocol("tunnel frame truncated".into()))?;
    let len = u32::from_be_bytes(*prefix) as usize;
    if rest.len() < len {
        return Err(TetherError::Protocol(format!(
            "tunnel frame declares {len} bytes, {} available",
            rest.len()
        )));
    }
    Ok(rest.split_at(len))
}

// ── Base64 serde helpers ──────────────────────────────────────────────────────

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let text = Option::<String>::deserialize(d)?;
        text.map(|t| STANDARD.decode(t.as_bytes()).map(Bytes::from))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
