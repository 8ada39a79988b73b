//! Ordered buffer sequences: the read-side [`BufferChain`] and the write-side
//! [`WriteQueue`].

mod write_queue;

pub use write_queue::WriteQueue;

use bytes::{Bytes, BytesMut};
use std::cell::Cell;
use std::collections::VecDeque;

/// Logically contiguous bytes held as a sequence of buffers.
///
/// Appended at the tail, consumed from the head. The total size is cached and
/// recomputed lazily after structural changes. Empty buffers are never stored.
#[derive(Debug, Default)]
pub struct BufferChain {
    buffers: VecDeque<Bytes>,
    size: Cell<Option<usize>>,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes in the chain.
    pub fn size(&self) -> usize {
        match self.size.get() {
            Some(size) => size,
            None => {
                let size = self.buffers.iter().map(Bytes::len).sum();
                self.size.set(Some(size));
                size
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of buffers in the chain.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, ordinal: usize) -> Option<&Bytes> {
        self.buffers.get(ordinal)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.buffers.iter()
    }

    pub fn append(&mut self, buffer: Bytes) {
        if !buffer.is_empty() {
            self.buffers.push_back(buffer);
            self.size.set(None);
        }
    }

    pub fn append_all<I: IntoIterator<Item = Bytes>>(&mut self, buffers: I) {
        for buffer in buffers {
            self.append(buffer);
        }
    }

    /// Puts `buffers` in front of the current head, keeping their order.
    pub fn add_first(&mut self, buffers: Vec<Bytes>) {
        for buffer in buffers.into_iter().rev() {
            if !buffer.is_empty() {
                self.buffers.push_front(buffer);
            }
        }
        self.size.set(None);
    }

    /// Removes and returns the first `len` bytes, splitting the boundary
    /// buffer. Returns fewer bytes only if the chain is shorter.
    pub fn split_to(&mut self, len: usize) -> Vec<Bytes> {
        let mut remaining = len;
        let mut taken = Vec::new();
        while remaining > 0 {
            let Some(mut head) = self.buffers.pop_front() else {
                break;
            };
            if head.len() <= remaining {
                remaining -= head.len();
                taken.push(head);
            } else {
                taken.push(head.split_to(remaining));
                remaining = 0;
                self.buffers.push_front(head);
            }
        }
        self.size.set(None);
        taken
    }

    /// Drops the first `len` bytes.
    pub fn discard(&mut self, len: usize) {
        self.split_to(len);
    }

    /// Removes everything.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.size.set(Some(0));
        self.buffers.drain(..).collect()
    }

    /// Copies the first `dst.len()` bytes without consuming them. Returns false
    /// if the chain holds fewer bytes.
    pub fn peek_into(&self, dst: &mut [u8]) -> bool {
        if self.size() < dst.len() {
            return false;
        }
        let mut filled = 0;
        for buffer in &self.buffers {
            if filled == dst.len() {
                break;
            }
            let n = buffer.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&buffer[..n]);
            filled += n;
        }
        true
    }
}

/// Merges `buffers` into one, without copying when there is only one.
pub fn merge(mut buffers: Vec<Bytes>) -> Bytes {
    match buffers.len() {
        0 => Bytes::new(),
        1 => buffers.swap_remove(0),
        _ => {
            let total = buffers.iter().map(Bytes::len).sum();
            let mut merged = BytesMut::with_capacity(total);
            for buffer in &buffers {
                merged.extend_from_slice(buffer);
            }
            merged.freeze()
        }
    }
}
