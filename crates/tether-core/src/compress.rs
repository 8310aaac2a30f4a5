//! Payload compression.
//!
//! Bodies are gzip encoded before they are split into chunks and decoded
//! only after every chunk has been reassembled. An empty input maps to an
//! empty output in both directions so body-less requests carry no bytes.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::TetherError;

pub fn compress(data: &[u8]) -> Result<Vec<u8>, TetherError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), Compression::default());
    encoder.write_all(data).map_err(TetherError::Compression)?;
    encoder.finish().map_err(TetherError::Compression)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, TetherError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(data.len() * 2);
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(TetherError::Compression)?;
    Ok(out)
}
