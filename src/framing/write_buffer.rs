use crate::error::Error;
use bytes::{Bytes, BytesMut};

// Bytes written after the write mark. While `cursor` is set, writes overwrite
// from there instead of appending.
#[derive(Debug, Default)]
struct MarkedRegion {
    data: BytesMut,
    cursor: Option<usize>,
}

impl MarkedRegion {
    fn write(&mut self, src: &[u8]) {
        match self.cursor {
            Some(pos) => {
                let overlap = src.len().min(self.data.len() - pos);
                self.data[pos..pos + overlap].copy_from_slice(&src[..overlap]);
                self.data.extend_from_slice(&src[overlap..]);
                let next = pos + src.len();
                self.cursor = (next < self.data.len()).then_some(next);
            }
            None => self.data.extend_from_slice(src),
        }
    }
}

/// Application output of a connection that has not been flushed yet.
///
/// [`mark_write_position`](Self::mark_write_position) holds back everything
/// written afterwards. [`reset_to_write_mark`](Self::reset_to_write_mark) moves
/// the write position back to the mark so a placeholder such as a length field
/// can be overwritten, and [`remove_write_mark`](Self::remove_write_mark)
/// releases the held bytes.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    pending: Vec<Bytes>,
    marked: Option<MarkedRegion>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written and not yet taken, including marked bytes.
    pub fn size(&self) -> usize {
        let pending: usize = self.pending.iter().map(Bytes::len).sum();
        pending + self.marked.as_ref().map_or(0, |region| region.data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn write_bytes(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        match self.marked.as_mut() {
            Some(region) => region.write(&data),
            None => self.pending.push(data),
        }
    }

    pub fn write_slice(&mut self, data: &[u8]) {
        match self.marked.as_mut() {
            Some(region) => region.write(data),
            None => self.write_bytes(Bytes::copy_from_slice(data)),
        }
    }

    pub fn write_str(&mut self, data: &str) {
        self.write_slice(data.as_bytes());
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_slice(&[value]);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_slice(&value.to_be_bytes());
    }

    /// Writes a 4-byte big-endian length followed by what `body` writes.
    ///
    /// The length field is written as a placeholder first and backpatched
    /// through the write mark. Returns the payload length.
    pub fn write_length_prefixed<F>(&mut self, body: F) -> Result<usize, Error>
    where
        F: FnOnce(&mut WriteBuffer),
    {
        if self.is_write_marked() {
            return Err(Error::WriteMarkActive);
        }
        self.mark_write_position();
        self.write_u32(0);
        body(self);
        let len = self.marked_size() - 4;
        let encoded = u32::try_from(len).map_err(|_| {
            Error::MalformedData(format!("payload of {len} bytes does not fit a length prefix"))
        })?;
        self.reset_to_write_mark();
        self.write_u32(encoded);
        self.remove_write_mark();
        Ok(len)
    }

    // ============================================================================
    // Write Marks
    // ============================================================================

    /// Starts holding back written bytes. An existing mark is removed first.
    pub fn mark_write_position(&mut self) {
        self.remove_write_mark();
        self.marked = Some(MarkedRegion::default());
    }

    /// Moves the write position back to the mark. Returns false if no mark
    /// is set.
    pub fn reset_to_write_mark(&mut self) -> bool {
        match self.marked.as_mut() {
            Some(region) => {
                region.cursor = (!region.data.is_empty()).then_some(0);
                true
            }
            None => false,
        }
    }

    /// Releases the bytes held since the mark.
    pub fn remove_write_mark(&mut self) {
        if let Some(region) = self.marked.take() {
            if !region.data.is_empty() {
                self.pending.push(region.data.freeze());
            }
        }
    }

    pub fn is_write_marked(&self) -> bool {
        self.marked.is_some()
    }

    fn marked_size(&self) -> usize {
        self.marked.as_ref().map_or(0, |region| region.data.len())
    }

    /// Takes the bytes that are ready to be flushed. Marked bytes stay.
    pub(crate) fn take_pending(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.pending)
    }

    /// Drops everything, including marked bytes.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.marked = None;
    }
}

