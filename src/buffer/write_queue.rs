use super::BufferChain;
use bytes::Bytes;

/// Pending output of one connection.
///
/// A writer leases data from the head, attempts a write syscall and then
/// commits exactly the bytes the syscall accepted with
/// [`remove_leased`](Self::remove_leased). Until then the leased bytes stay in
/// the queue, so a short or failed write never loses the remainder.
#[derive(Debug, Default)]
pub struct WriteQueue {
    chain: BufferChain,
    leased_bytes: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Bytes not yet written.
    pub fn size(&self) -> usize {
        self.chain.size()
    }

    pub fn append(&mut self, buffers: Vec<Bytes>) {
        self.chain.append_all(buffers);
    }

    /// Re-queues `buffers` ahead of everything else.
    pub fn add_first(&mut self, buffers: Vec<Bytes>) {
        debug_assert_eq!(self.leased_bytes, 0, "add_first while a lease is open");
        self.chain.add_first(buffers);
    }

    /// Returns head buffers worth at most `max_bytes` without removing them.
    ///
    /// The first buffer is always included, even when it alone exceeds
    /// `max_bytes`. An empty queue yields an empty lease.
    pub fn lease(&mut self, max_bytes: usize) -> Vec<Bytes> {
        let mut leased = Vec::new();
        let mut total = 0;
        for buffer in self.chain.iter() {
            if !leased.is_empty() && total + buffer.len() > max_bytes {
                break;
            }
            total += buffer.len();
            leased.push(buffer.clone());
        }
        self.leased_bytes = total;
        leased
    }

    /// Bytes leased and not yet committed.
    pub fn leased_size(&self) -> usize {
        self.leased_bytes
    }

    /// Commits `written` bytes of the open lease.
    pub fn remove_leased(&mut self, written: usize) {
        let written = written.min(self.leased_bytes);
        self.chain.discard(written);
        self.leased_bytes -= written;
    }

    /// Takes every pending buffer out of the queue, closing any lease.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.leased_bytes = 0;
        self.chain.drain()
    }
}
