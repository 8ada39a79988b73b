use super::{extract, extract_available, extract_length, scan, ScanIndex};
use crate::buffer::{merge, BufferChain};
use crate::error::Error;
use bytes::Bytes;
use std::io::Write;

/// Received, not yet consumed bytes of a connection.
///
/// The scan index of the last delimiter read is cached, so retrying a read
/// after more data arrived only scans the new buffers. A read mark records
/// everything consumed after [`mark_read_position`](Self::mark_read_position)
/// so it can be pushed back with [`reset_to_read_mark`](Self::reset_to_read_mark).
#[derive(Debug)]
pub struct ReadBuffer {
    chain: BufferChain,
    index: Option<ScanIndex>,
    mark: Option<Vec<Bytes>>,
    max_read_size: usize,
}

impl ReadBuffer {
    pub fn new(max_read_size: usize) -> Self {
        Self {
            chain: BufferChain::new(),
            index: None,
            mark: None,
            max_read_size,
        }
    }

    /// Bytes available for reading.
    pub fn available(&self) -> usize {
        self.chain.size()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn max_read_size(&self) -> usize {
        self.max_read_size
    }

    pub fn set_max_read_size(&mut self, max_read_size: usize) {
        self.max_read_size = max_read_size;
    }

    /// Appends received data. A cached scan index stays valid.
    pub fn append(&mut self, buffers: Vec<Bytes>) {
        self.chain.append_all(buffers);
    }

    /// Takes every buffered byte, bypassing any read mark.
    pub(crate) fn drain(&mut self) -> Vec<Bytes> {
        self.index = None;
        self.mark = None;
        self.chain.drain()
    }

    // ============================================================================
    // Delimited Reads
    // ============================================================================

    /// Reads the record in front of `delimiter`, using the configured maximum
    /// record size.
    pub fn read_bytes_by_delimiter(&mut self, delimiter: &[u8]) -> Result<Bytes, Error> {
        let max = self.max_read_size;
        self.read_bytes_by_delimiter_limited(delimiter, max)
    }

    /// Reads the record in front of `delimiter` and discards the delimiter.
    ///
    /// Fails with [`Error::BufferUnderflow`] while the delimiter has not
    /// arrived, and with [`Error::MaxReadSizeExceeded`] once more than
    /// `max_len` bytes precede it (or could precede it).
    pub fn read_bytes_by_delimiter_limited(
        &mut self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Bytes, Error> {
        let index = self.scan(delimiter);
        if index.settled_len() > max_len {
            return Err(Error::MaxReadSizeExceeded { max: max_len });
        }
        if !index.is_found() {
            return Err(Error::BufferUnderflow);
        }

        self.index = None;
        let record = extract(&mut self.chain, &index)?;
        self.record_consumed(&record);
        self.record_consumed(&[Bytes::copy_from_slice(delimiter)]);
        Ok(merge(record))
    }

    /// Reads the record in front of `delimiter` as UTF-8.
    pub fn read_string_by_delimiter(&mut self, delimiter: &str) -> Result<String, Error> {
        let record = self.read_bytes_by_delimiter(delimiter.as_bytes())?;
        String::from_utf8(record.to_vec())
            .map_err(|e| Error::MalformedData(format!("record is not UTF-8: {e}")))
    }

    /// Writes everything that is certainly in front of `delimiter` to `sink`.
    ///
    /// Returns `true` once the delimiter was found and consumed. Bytes that
    /// might be the start of the delimiter stay buffered.
    pub fn read_available_by_delimiter<W: Write>(
        &mut self,
        delimiter: &[u8],
        sink: &mut W,
    ) -> Result<bool, Error> {
        let index = self.scan(delimiter);
        let found = index.is_found();
        self.index = None;

        match extract_available(&mut self.chain, &index) {
            Some(buffers) => {
                for buffer in &buffers {
                    sink.write_all(buffer)?;
                }
                self.record_consumed(&buffers);
                if found {
                    self.record_consumed(&[Bytes::copy_from_slice(delimiter)]);
                }
            }
            None => {
                // Nothing settled yet, so the scan just done stays reusable.
                self.index = Some(index);
            }
        }
        Ok(found)
    }

    // ============================================================================
    // Fixed Length Reads
    // ============================================================================

    pub fn read_bytes_by_length(&mut self, len: usize) -> Result<Bytes, Error> {
        let buffers = extract_length(&mut self.chain, len)?;
        self.index = None;
        self.record_consumed(&buffers);
        Ok(merge(buffers))
    }

    /// Takes everything currently buffered.
    pub fn read_available(&mut self) -> Vec<Bytes> {
        self.index = None;
        let buffers = self.chain.drain();
        self.record_consumed(&buffers);
        buffers
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Reads a record framed by a 4-byte big-endian length.
    ///
    /// Nothing is consumed unless the whole record is available, so an
    /// underflow can be retried later without losing the length field.
    pub fn read_length_prefixed(&mut self) -> Result<Bytes, Error> {
        let mut prefix = [0u8; 4];
        if !self.chain.peek_into(&mut prefix) {
            return Err(Error::BufferUnderflow);
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_read_size {
            return Err(Error::MaxReadSizeExceeded {
                max: self.max_read_size,
            });
        }
        if self.chain.size() < prefix.len() + len {
            return Err(Error::BufferUnderflow);
        }

        let header = self.chain.split_to(prefix.len());
        self.record_consumed(&header);
        self.read_bytes_by_length(len)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut value = [0u8; N];
        if !self.chain.peek_into(&mut value) {
            return Err(Error::BufferUnderflow);
        }
        let consumed = self.chain.split_to(N);
        self.index = None;
        self.record_consumed(&consumed);
        Ok(value)
    }

    // ============================================================================
    // Read Marks
    // ============================================================================

    /// Starts recording consumed bytes. Replaces an existing mark.
    pub fn mark_read_position(&mut self) {
        self.mark = Some(Vec::new());
    }

    /// Pushes every byte consumed since the mark back to the front and removes
    /// the mark. Returns false if no mark was set.
    pub fn reset_to_read_mark(&mut self) -> bool {
        match self.mark.take() {
            Some(consumed) => {
                self.index = None;
                self.chain.add_first(consumed);
                true
            }
            None => false,
        }
    }

    pub fn remove_read_mark(&mut self) {
        self.mark = None;
    }

    pub fn is_read_marked(&self) -> bool {
        self.mark.is_some()
    }

    // ============================================================================
    // Internal Helpers
    // ============================================================================

    fn scan(&mut self, delimiter: &[u8]) -> ScanIndex {
        let index = match self.index.take() {
            Some(index) if index.delimiter() == delimiter => index,
            _ => ScanIndex::new(delimiter),
        };
        let index = scan(&self.chain, index);
        self.index = Some(index.clone());
        index
    }

    fn record_consumed(&mut self, buffers: &[Bytes]) {
        if let Some(mark) = self.mark.as_mut() {
            mark.extend(buffers.iter().cloned());
        }
    }
}
