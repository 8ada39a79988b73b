//! Record framing over a [`BufferChain`].
//!
//! A delimiter scan is resumable: [`scan`] takes the [`ScanIndex`] returned by
//! the previous call and continues with the first buffer it has not looked at
//! yet. Matching is a plain forward automaton. On a mismatch the partial match
//! is dropped and the current byte is compared against the first delimiter
//! byte again. There is no further backtracking: `"ab"` is found in `"aab"`,
//! but `"aab"` is not found in `"aaab"`.

mod read_buffer;
mod write_buffer;

pub use read_buffer::ReadBuffer;
pub use write_buffer::WriteBuffer;

use crate::buffer::BufferChain;
use crate::error::Error;
use bytes::Bytes;
use std::io::Write;

/// Resumable cursor of a delimiter scan.
///
/// Only valid for the chain it was produced from, and only until bytes are
/// removed from the head of that chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanIndex {
    delimiter: Vec<u8>,
    partial: usize,
    match_start_buffer: usize,
    match_start_offset: usize,
    scanned_buffers: usize,
    scanned_bytes: usize,
    found: bool,
}

impl ScanIndex {
    pub fn new(delimiter: &[u8]) -> Self {
        Self {
            delimiter: delimiter.to_vec(),
            partial: 0,
            match_start_buffer: 0,
            match_start_offset: 0,
            scanned_buffers: 0,
            scanned_bytes: 0,
            // An empty delimiter matches at the very start.
            found: delimiter.is_empty(),
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Number of delimiter bytes matched at the end of the scanned region.
    pub fn partial_match(&self) -> usize {
        self.partial
    }

    /// Buffer ordinal and offset where the current (partial) match starts.
    pub fn match_start(&self) -> (usize, usize) {
        (self.match_start_buffer, self.match_start_offset)
    }

    /// Buffers fully scanned so far.
    pub fn scanned_buffers(&self) -> usize {
        self.scanned_buffers
    }

    /// Bytes looked at so far, including matched delimiter bytes.
    pub fn scanned_bytes(&self) -> usize {
        self.scanned_bytes
    }

    /// Length of the record in front of the delimiter, once found.
    pub fn record_len(&self) -> Option<usize> {
        self.found
            .then(|| self.scanned_bytes - self.delimiter.len())
    }

    /// Bytes that can no longer be part of the delimiter.
    pub fn settled_len(&self) -> usize {
        match self.record_len() {
            Some(len) => len,
            None => self.scanned_bytes - self.partial,
        }
    }
}

/// Advances `index` over the buffers of `chain` it has not scanned yet.
pub fn scan(chain: &BufferChain, mut index: ScanIndex) -> ScanIndex {
    if index.found {
        return index;
    }

    for ordinal in index.scanned_buffers..chain.buffer_count() {
        let Some(buffer) = chain.buffer(ordinal) else {
            break;
        };
        for (offset, &byte) in buffer.iter().enumerate() {
            index.scanned_bytes += 1;
            if byte == index.delimiter[index.partial] {
                if index.partial == 0 {
                    index.match_start_buffer = ordinal;
                    index.match_start_offset = offset;
                }
                index.partial += 1;
            } else {
                index.partial = 0;
                if byte == index.delimiter[0] {
                    index.match_start_buffer = ordinal;
                    index.match_start_offset = offset;
                    index.partial = 1;
                }
            }

            if index.partial == index.delimiter.len() {
                index.found = true;
                index.scanned_buffers = ordinal;
                return index;
            }
        }
        index.scanned_buffers = ordinal + 1;
    }

    index
}

/// Removes the record and its delimiter from `chain` and returns the record.
///
/// The delimiter may span several buffers. Bytes behind the delimiter stay at
/// the head of the chain. Fails with [`Error::BufferUnderflow`] if `index` has
/// not found the delimiter.
pub fn extract(chain: &mut BufferChain, index: &ScanIndex) -> Result<Vec<Bytes>, Error> {
    let len = index.record_len().ok_or(Error::BufferUnderflow)?;
    let record = chain.split_to(len);
    chain.discard(index.delimiter.len());
    Ok(record)
}

/// Like [`extract`] but writes the record to `sink`. Returns the record length.
pub fn extract_into<W: Write>(
    chain: &mut BufferChain,
    index: &ScanIndex,
    sink: &mut W,
) -> Result<usize, Error> {
    let record = extract(chain, index)?;
    let mut written = 0;
    for buffer in &record {
        sink.write_all(buffer)?;
        written += buffer.len();
    }
    Ok(written)
}

/// Drains what can be handed out without knowing where the record ends.
///
/// With a found delimiter this behaves like [`extract`]. Otherwise every
/// scanned byte except a trailing partial delimiter match is removed and
/// returned. A drain that would return zero bytes reports `None`, even when
/// the chain is not empty (its content is all partial match).
pub fn extract_available(chain: &mut BufferChain, index: &ScanIndex) -> Option<Vec<Bytes>> {
    if index.found {
        return extract(chain, index).ok();
    }
    let len = index.settled_len();
    if len == 0 {
        return None;
    }
    Some(chain.split_to(len))
}

/// Removes exactly `len` bytes, or nothing if fewer are available.
pub fn extract_length(chain: &mut BufferChain, len: usize) -> Result<Vec<Bytes>, Error> {
    if chain.size() < len {
        return Err(Error::BufferUnderflow);
    }
    Ok(chain.split_to(len))
}
