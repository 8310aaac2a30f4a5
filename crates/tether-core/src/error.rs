//! Error taxonomy shared by the chunked RPC and the HTTP tunnel.

use std::time::Duration;

use crate::wire::status;

#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A single envelope does not fit into one channel message.
    #[error("payload of {size} bytes exceeds channel limit of {limit} bytes")]
    TransportLimit { size: usize, limit: usize },

    /// The remote handler ran but answered with a non-success status.
    #[error("remote returned status {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    #[error("operation {0} is not registered")]
    NotRegistered(String),

    /// Handle or request id unknown to this peer, usually because it was evicted.
    #[error("no exchange with id {0}")]
    UnknownExchange(String),

    /// Two exchanges minted with the same id. Indicates an id generation bug.
    #[error("exchange {0} is already registered")]
    DuplicateExchange(String),

    /// A declared body length above what this peer is willing to buffer.
    #[error("declared body of {size} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { size: u64, limit: usize },

    #[error("unsupported http method: {0}")]
    InvalidMethod(String),

    #[error("malformed event tag: {0}")]
    InvalidTag(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("serialization failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled by caller")]
    Cancelled,
}

impl TetherError {
    /// HTTP-like status code used when this error crosses the channel.
    pub fn status(&self) -> u16 {
        match self {
            TetherError::TransportLimit { .. } | TetherError::BodyTooLarge { .. } => {
                status::PAYLOAD_TOO_LARGE
            }
            TetherError::RemoteStatus { status, .. } => *status,
            TetherError::NotRegistered(_) | TetherError::UnknownExchange(_) => status::NOT_FOUND,
            TetherError::InvalidMethod(_)
            | TetherError::InvalidTag(_)
            | TetherError::Protocol(_)
            | TetherError::Codec(_) => status::BAD_REQUEST,
            TetherError::Transport(_) => status::BAD_GATEWAY,
            TetherError::Timeout(_) => status::GATEWAY_TIMEOUT,
            TetherError::Cancelled => status::CLIENT_CLOSED_REQUEST,
            TetherError::DuplicateExchange(_) | TetherError::Compression(_) => {
                status::INTERNAL_ERROR
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TetherError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TetherError::Cancelled)
    }
}
