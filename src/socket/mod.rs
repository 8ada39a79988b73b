//! The socket end of a connection: read and write syscalls, write queue and
//! write tasks, connect completion and socket options.

mod options;
pub(crate) mod write_task;

pub use options::{SocketOption, SocketOptionName};

use crate::buffer::WriteQueue;
use crate::error::Error;
use crate::memory::UnsynchronizedPool;
use bytes::Bytes;
use mio::net::TcpStream;
use socket2::SockRef;
use std::io::{self, ErrorKind, Read};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};
use write_task::{TaskProgress, WriteTask, WriteTaskArena};

/// Lifecycle of a socket. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    /// Close requested, waiting for the write queue to drain.
    Closing,
    Closed,
}

impl SocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketState::Connecting => "connecting",
            SocketState::Open => "open",
            SocketState::Closing => "closing",
            SocketState::Closed => "closed",
        }
    }
}

/// What one readable event produced.
#[derive(Debug, Default)]
pub(crate) struct ReadOutcome {
    pub(crate) data: Vec<Bytes>,
    pub(crate) peer_closed: bool,
    pub(crate) error: Option<io::Error>,
}

impl ReadOutcome {
    pub(crate) fn len(&self) -> usize {
        self.data.iter().map(Bytes::len).sum()
    }
}

/// What one write pass produced.
#[derive(Debug, Default)]
pub(crate) struct WriteOutcome {
    /// Buffers that went out completely.
    pub(crate) written: Vec<Bytes>,
    pub(crate) bytes: usize,
    /// The error and the buffers of the task it hit.
    pub(crate) failed: Option<(io::Error, Vec<Bytes>)>,
}

pub(crate) struct SocketHandler {
    stream: TcpStream,
    state: SocketState,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    send_queue: WriteQueue,
    pending_task: Option<WriteTask>,
    receive_chunk_size: usize,
    send_buffer_size: usize,
    min_buffer_size: usize,
    peer_closed: bool,
    connected: AtomicBool,
    disconnected: AtomicBool,
    opened_at: Instant,
    last_received: Instant,
    last_sent: Instant,
    bytes_received: u64,
    bytes_sent: u64,
}

// ============================================================================
// Constructors
// ============================================================================

impl SocketHandler {
    /// Wraps a stream returned by `accept()`.
    pub(crate) fn accepted(
        stream: TcpStream,
        preallocation_size: usize,
        min_buffer_size: usize,
    ) -> Result<Self, Error> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Self::new(
            stream,
            SocketState::Open,
            local_addr,
            peer_addr,
            preallocation_size,
            min_buffer_size,
        )
    }

    /// Wraps a stream whose non-blocking connect to `peer_addr` is in progress.
    pub(crate) fn connecting(
        stream: TcpStream,
        peer_addr: SocketAddr,
        preallocation_size: usize,
        min_buffer_size: usize,
    ) -> Result<Self, Error> {
        let local_addr = stream.local_addr()?;
        Self::new(
            stream,
            SocketState::Connecting,
            local_addr,
            peer_addr,
            preallocation_size,
            min_buffer_size,
        )
    }

    fn new(
        stream: TcpStream,
        state: SocketState,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        preallocation_size: usize,
        min_buffer_size: usize,
    ) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let socket = SockRef::from(&stream);
        let receive_hint = socket.recv_buffer_size().unwrap_or(preallocation_size);
        let send_hint = socket.send_buffer_size().unwrap_or(preallocation_size);
        let now = Instant::now();

        Ok(Self {
            stream,
            state,
            local_addr,
            peer_addr,
            send_queue: WriteQueue::new(),
            pending_task: None,
            receive_chunk_size: receive_hint.min(preallocation_size).max(min_buffer_size),
            send_buffer_size: send_hint.max(min_buffer_size),
            min_buffer_size,
            peer_closed: false,
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            opened_at: now,
            last_received: now,
            last_sent: now,
            bytes_received: 0,
            bytes_sent: 0,
        })
    }
}

// ============================================================================
// State
// ============================================================================

impl SocketHandler {
    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn state(&self) -> SocketState {
        self.state
    }

    /// Open and not closed by the peer.
    pub(crate) fn is_open(&self) -> bool {
        self.state == SocketState::Open && !self.peer_closed
    }

    pub(crate) fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.state == SocketState::Connecting
    }

    pub(crate) fn begin_closing(&mut self) {
        if self.state == SocketState::Open {
            self.state = SocketState::Closing;
        }
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub(crate) fn last_received(&self) -> Instant {
        self.last_received
    }

    /// When the socket last accepted output.
    pub(crate) fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub(crate) fn touch_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Returns true exactly once, for the caller that should notify connect.
    pub(crate) fn mark_connected(&self) -> bool {
        !self.connected.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn was_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Returns true exactly once, for the caller that should notify disconnect.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_option(&self, option: SocketOption) -> Result<(), Error> {
        options::set_option(&self.stream, option)?;
        Ok(())
    }

    pub(crate) fn option(&self, name: SocketOptionName) -> Result<SocketOption, Error> {
        options::option(&self.stream, name)
    }

    /// Completes a non-blocking connect. `Ok(false)` means still in progress.
    pub(crate) fn finish_connect(&mut self) -> Result<bool, io::Error> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(peer_addr) => {
                self.peer_addr = peer_addr;
                if let Ok(local_addr) = self.stream.local_addr() {
                    self.local_addr = local_addr;
                }
                self.state = SocketState::Open;
                let now = Instant::now();
                self.opened_at = now;
                self.last_received = now;
                self.last_sent = now;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }
}

// ============================================================================
// Socket I/O
// ============================================================================

impl SocketHandler {
    /// Reads until the socket would block.
    ///
    /// End of stream shuts the socket down right away, so `is_open()` turns
    /// false before the data read in the same pass is delivered.
    pub(crate) fn read(&mut self, pool: &mut UnsynchronizedPool) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let local_addr = &self.local_addr;
        let peer_addr = &self.peer_addr;

        loop {
            let mut buffer = pool.acquire(self.receive_chunk_size);
            let capacity = buffer.capacity();
            buffer.resize(capacity, 0);

            match self.stream.read(&mut buffer[..]) {
                Ok(0) => {
                    pool.recycle(buffer, self.min_buffer_size);
                    debug!(%local_addr, %peer_addr, "Peer closed connection");
                    outcome.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    trace!(len = n, %local_addr, %peer_addr, "Read data from socket");
                    self.bytes_received += n as u64;
                    outcome
                        .data
                        .push(pool.extract_and_recycle(buffer, n, self.min_buffer_size));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    pool.recycle(buffer, self.min_buffer_size);
                    break;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {
                    pool.recycle(buffer, self.min_buffer_size);
                }
                Err(err) => {
                    pool.recycle(buffer, self.min_buffer_size);
                    if err.kind() == ErrorKind::ConnectionReset {
                        warn!(%local_addr, %peer_addr, "Connection reset");
                    } else {
                        warn!(%local_addr, %peer_addr, ?err, "Error reading from socket");
                    }
                    outcome.error = Some(err);
                    break;
                }
            }
        }

        if !outcome.data.is_empty() {
            self.last_received = Instant::now();
        }
        if outcome.peer_closed {
            self.peer_closed = true;
            self.shutdown();
        }
        outcome
    }

    /// Queues buffers for writing.
    pub(crate) fn enqueue(&mut self, buffers: Vec<Bytes>) {
        self.send_queue.append(buffers);
    }

    /// Bytes queued or held by a pending write task.
    pub(crate) fn pending_size(&self) -> usize {
        self.send_queue.size()
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.send_queue.is_empty() || self.pending_task.is_some()
    }

    /// Writes queued data until the queue is empty or the socket would block.
    pub(crate) fn write(&mut self, arena: &mut WriteTaskArena) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        let local_addr = &self.local_addr;
        let peer_addr = &self.peer_addr;

        loop {
            let mut task = match self.pending_task.take() {
                Some(task) => task,
                None if self.send_queue.is_empty() => break,
                None => {
                    let leased = self.send_queue.lease(self.send_buffer_size);
                    arena.new_task(leased, self.send_buffer_size)
                }
            };

            match task.write(&mut self.stream) {
                TaskProgress::Written { n, complete } => {
                    self.send_queue.remove_leased(n);
                    self.bytes_sent += n as u64;
                    outcome.bytes += n;
                    trace!(len = n, remaining = task.remaining(), %local_addr, %peer_addr, "Wrote to socket");
                    if complete {
                        outcome.written.extend(task.take_buffers());
                        arena.release(task);
                    } else {
                        self.pending_task = Some(task);
                    }
                }
                TaskProgress::WouldBlock => {
                    self.pending_task = Some(task);
                    break;
                }
                TaskProgress::Failed(err) => {
                    if err.kind() == ErrorKind::BrokenPipe {
                        warn!(%local_addr, %peer_addr, "Broken pipe");
                    } else if err.kind() == ErrorKind::ConnectionReset {
                        warn!(%local_addr, %peer_addr, "Connection reset");
                    } else {
                        warn!(%local_addr, %peer_addr, ?err, "Error writing to socket");
                    }
                    // A failed task is not reusable and is dropped here.
                    outcome.failed = Some((err, task.take_buffers()));
                    break;
                }
            }
        }

        if outcome.bytes > 0 {
            self.last_sent = Instant::now();
        }
        outcome
    }

    pub(crate) fn shutdown(&mut self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            if err.kind() != ErrorKind::NotConnected {
                debug!(?err, "Error shutting down socket");
            }
        }
    }

    /// Final teardown: shuts the socket down and drops queued output.
    /// Returns the number of bytes discarded.
    pub(crate) fn close(&mut self, arena: &mut WriteTaskArena) -> usize {
        if self.state == SocketState::Closed {
            return 0;
        }
        self.state = SocketState::Closed;
        self.shutdown();
        if let Some(mut task) = self.pending_task.take() {
            task.take_buffers();
            arena.release(task);
        }
        let discarded = self.send_queue.size();
        self.send_queue.drain();
        discarded
    }
}
