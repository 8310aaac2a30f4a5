//! Sequencer — splits buffers into bounded chunks and puts them back together.
//!
//! Two reassembly shapes exist. The call channel is half duplex, so chunks
//! always arrive in order and are appended at the running offset
//! ([`Reassembler`]). The event channel may reorder messages, so chunks carry
//! an explicit index and land in a slot ([`SlotAssembler`]).

use bytes::Bytes;

use crate::error::TetherError;

/// Split `buffer` into ordered chunks of at most `max_chunk_size` bytes.
///
/// No padding; the last chunk may be shorter. An empty buffer yields no chunks.
pub fn split(buffer: &[u8], max_chunk_size: usize) -> Vec<&[u8]> {
    debug_assert!(max_chunk_size > 0, "chunk size must be positive");
    buffer.chunks(max_chunk_size.max(1)).collect()
}

/// Number of chunks `split` produces for a buffer of `len` bytes.
pub fn chunk_count(len: usize, max_chunk_size: usize) -> usize {
    len.div_ceil(max_chunk_size.max(1))
}

// ── Sequential reassembly ─────────────────────────────────────────────────────

/// Up-front capacity a [`Reassembler`] reserves at most. The declared total
/// comes from the remote peer; beyond this the buffer grows with the data.
const MAX_PREALLOCATION: usize = 1024 * 1024;

/// Accumulates in-order chunks up to the declared total.
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    total: usize,
}

impl Reassembler {
    pub fn new(total_length: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(total_length.min(MAX_PREALLOCATION)),
            total: total_length,
        }
    }

    /// Copy `chunk` at the current offset. Returns true once complete.
    pub fn append(&mut self, chunk: &[u8]) -> Result<bool, TetherError> {
        if self.buffer.len() + chunk.len() > self.total {
            return Err(TetherError::Protocol(format!(
                "chunk of {} bytes overruns declared length {} at offset {}",
                chunk.len(),
                self.total,
                self.buffer.len()
            )));
        }
        self.buffer.extend_from_slice(chunk);
        Ok(self.is_complete())
    }

    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.len() == self.total
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

// ── Indexed reassembly ────────────────────────────────────────────────────────

/// Collects chunks by index. Tolerates reordering; a duplicate overwrites its slot.
#[derive(Debug)]
pub struct SlotAssembler {
    slots: Vec<Option<Bytes>>,
    filled: usize,
}

impl SlotAssembler {
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![None; count],
            filled: 0,
        }
    }

    /// Store `chunk` at zero-based `index`.
    pub fn insert(&mut self, index: usize, chunk: Bytes) -> Result<(), TetherError> {
        let count = self.slots.len();
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            TetherError::Protocol(format!("chunk index {index} outside 0..{count}"))
        })?;
        if slot.is_none() {
            self.filled += 1;
        }
        *slot = Some(chunk);
        Ok(())
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len() && self.slots.iter().all(Option::is_some)
    }

    /// Concatenate all slots behind `prefix`. None while any slot is empty.
    pub fn assemble(self, prefix: &[u8]) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let size = prefix.len() + self.slots.iter().flatten().map(Bytes::len).sum::<usize>();
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(prefix);
        for chunk in self.slots.into_iter().flatten() {
            out.extend_from_slice(&chunk);
        }
        Some(out)
    }
}
