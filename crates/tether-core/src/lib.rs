//! tether-core — wire types, chunk sequencing, compression and configuration.
//! All other tether crates depend on this one.

pub mod compress;
pub mod config;
pub mod error;
pub mod http;
pub mod sequencer;
pub mod wire;

pub use error::TetherError;
pub use http::{HeaderMap, HttpMethod, HttpRequest, HttpResponse};
pub use wire::{EventTag, MethodChunk, TunnelRequestHeader, TunnelResponse};
