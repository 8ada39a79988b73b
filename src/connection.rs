use crate::chain::throttle::ThrottleStage;
use crate::chain::{ChainOutput, IoChain, StageEvent};
use crate::error::Error;
use crate::framing::{ReadBuffer, WriteBuffer};
use crate::socket::{SocketHandler, SocketOption, SocketOptionName, SocketState};
use crate::tls::{TlsMode, TlsStage, TlsState};
use bytes::Bytes;
use std::io::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outbound rate limit of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRate {
    Unlimited,
    BytesPerSecond(u64),
}

/// One TCP connection as seen from a [`Handler`](crate::Handler).
///
/// Handed to every callback. Reads consume the data received so far; writes
/// go to a write buffer that is flushed into the connection's stages and the
/// socket write queue on [`flush`](Self::flush), or right away while
/// autoflush is on (the default). Close and read suspension requests are
/// carried out by the dispatcher when the callback returns.
pub struct Connection {
    id: usize,
    socket: SocketHandler,
    chain: IoChain,
    read_buffer: ReadBuffer,
    write_buffer: WriteBuffer,
    tls_mode: TlsMode,
    secured: bool,
    autoflush: bool,
    read_suspended: bool,
    resume_requested: bool,
    data_ready: bool,
    connect_ready: bool,
    close_request: Option<bool>,
    closing: bool,
    idle_timeout: Option<Duration>,
    connection_timeout: Option<Duration>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Connection {
    pub(crate) fn new(
        id: usize,
        socket: SocketHandler,
        chain: IoChain,
        tls_mode: TlsMode,
        max_read_size: usize,
    ) -> Self {
        Self {
            id,
            socket,
            chain,
            read_buffer: ReadBuffer::new(max_read_size),
            write_buffer: WriteBuffer::new(),
            tls_mode,
            secured: false,
            autoflush: true,
            read_suspended: false,
            resume_requested: false,
            data_ready: false,
            connect_ready: false,
            close_request: None,
            closing: false,
            idle_timeout: None,
            connection_timeout: None,
        }
    }
}

// ============================================================================
// Connection Info
// ============================================================================

impl Connection {
    /// Process-unique connection id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// True while the socket is connected, not closed by the peer and no close
    /// has been requested.
    pub fn is_open(&self) -> bool {
        self.socket.is_open() && self.close_request.is_none() && !self.closing
    }

    /// True once a TLS handshake has completed on this connection.
    pub fn is_secure(&self) -> bool {
        self.secured
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    /// State of the TLS stage, `None` for plaintext connections.
    pub fn tls_state(&mut self) -> Option<TlsState> {
        self.chain.get_mut::<TlsStage>().map(|stage| stage.state())
    }

    pub fn state(&self) -> SocketState {
        self.socket.state()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.socket.peer_addr()
    }

    pub fn bytes_received(&self) -> u64 {
        self.socket.bytes_received()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.socket.bytes_sent()
    }

    /// When the connection was established.
    pub fn opened_at(&self) -> Instant {
        self.socket.opened_at()
    }

    /// When bytes were last received.
    pub fn last_received(&self) -> Instant {
        self.socket.last_received()
    }

    pub fn set_option(&self, option: SocketOption) -> Result<(), Error> {
        self.socket.set_option(option)
    }

    pub fn option(&self, name: SocketOptionName) -> Result<SocketOption, Error> {
        self.socket.option(name)
    }
}

// ============================================================================
// Read Operations
// ============================================================================

impl Connection {
    /// Bytes received and not consumed yet.
    pub fn available(&self) -> usize {
        self.read_buffer.available()
    }

    /// Reads one record terminated by `delimiter`, without the delimiter.
    pub fn read_bytes_by_delimiter(&mut self, delimiter: &[u8]) -> Result<Bytes, Error> {
        self.read_buffer.read_bytes_by_delimiter(delimiter)
    }

    pub fn read_bytes_by_delimiter_limited(
        &mut self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Bytes, Error> {
        self.read_buffer
            .read_bytes_by_delimiter_limited(delimiter, max_len)
    }

    pub fn read_string_by_delimiter(&mut self, delimiter: &str) -> Result<String, Error> {
        self.read_buffer.read_string_by_delimiter(delimiter)
    }

    /// Writes everything that cannot be part of `delimiter` into `sink`.
    /// Returns true once the delimiter was found and consumed.
    pub fn read_available_by_delimiter<W: Write>(
        &mut self,
        delimiter: &[u8],
        sink: &mut W,
    ) -> Result<bool, Error> {
        self.read_buffer.read_available_by_delimiter(delimiter, sink)
    }

    pub fn read_bytes_by_length(&mut self, len: usize) -> Result<Bytes, Error> {
        self.read_buffer.read_bytes_by_length(len)
    }

    pub fn read_available(&mut self) -> Vec<Bytes> {
        self.read_buffer.read_available()
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        self.read_buffer.read_u8()
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        self.read_buffer.read_i32()
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        self.read_buffer.read_u32()
    }

    pub fn read_i64(&mut self) -> Result<i64, Error> {
        self.read_buffer.read_i64()
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        self.read_buffer.read_u64()
    }

    /// Reads a 4-byte big-endian length and that many bytes. Nothing is
    /// consumed until the whole record is available.
    pub fn read_length_prefixed(&mut self) -> Result<Bytes, Error> {
        self.read_buffer.read_length_prefixed()
    }

    pub fn max_read_size(&self) -> usize {
        self.read_buffer.max_read_size()
    }

    pub fn set_max_read_size(&mut self, max_read_size: usize) {
        self.read_buffer.set_max_read_size(max_read_size);
    }

    pub fn mark_read_position(&mut self) {
        self.read_buffer.mark_read_position();
    }

    /// Puts everything read since the mark back. Returns false without a mark.
    pub fn reset_to_read_mark(&mut self) -> bool {
        self.read_buffer.reset_to_read_mark()
    }

    pub fn remove_read_mark(&mut self) {
        self.read_buffer.remove_read_mark();
    }
}

// ============================================================================
// Write Operations
// ============================================================================

impl Connection {
    pub fn write_bytes(&mut self, data: Bytes) -> Result<(), Error> {
        self.check_writable()?;
        self.write_buffer.write_bytes(data);
        self.autoflush()
    }

    pub fn write_slice(&mut self, data: &[u8]) -> Result<(), Error> {
        self.check_writable()?;
        self.write_buffer.write_slice(data);
        self.autoflush()
    }

    pub fn write_str(&mut self, data: &str) -> Result<(), Error> {
        self.check_writable()?;
        self.write_buffer.write_str(data);
        self.autoflush()
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), Error> {
        self.check_writable()?;
        self.write_buffer.write_u8(value);
        self.autoflush()
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), Error> {
        self.check_writable()?;
        self.write_buffer.write_i32(value);
        self.autoflush()
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        self.check_writable()?;
        self.write_buffer.write_u32(value);
        self.autoflush()
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), Error> {
        self.check_writable()?;
        self.write_buffer.write_i64(value);
        self.autoflush()
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), Error> {
        self.check_writable()?;
        self.write_buffer.write_u64(value);
        self.autoflush()
    }

    /// Writes a 4-byte big-endian length followed by whatever `body` writes.
    /// Returns the payload length.
    pub fn write_length_prefixed<F>(&mut self, body: F) -> Result<usize, Error>
    where
        F: FnOnce(&mut WriteBuffer),
    {
        self.check_writable()?;
        let len = self.write_buffer.write_length_prefixed(body)?;
        self.autoflush()?;
        Ok(len)
    }

    /// Marks the current write position. Data written from here on is held
    /// back until [`remove_write_mark`](Self::remove_write_mark).
    pub fn mark_write_position(&mut self) {
        self.write_buffer.mark_write_position();
    }

    /// Following writes overwrite the bytes written since the mark.
    pub fn reset_to_write_mark(&mut self) -> bool {
        self.write_buffer.reset_to_write_mark()
    }

    pub fn remove_write_mark(&mut self) -> Result<(), Error> {
        self.write_buffer.remove_write_mark();
        self.autoflush()
    }

    pub fn set_autoflush(&mut self, autoflush: bool) {
        self.autoflush = autoflush;
    }

    pub fn autoflush_enabled(&self) -> bool {
        self.autoflush
    }

    /// Pushes buffered writes into the stages and the socket write queue.
    pub fn flush(&mut self) -> Result<(), Error> {
        let pending = self.write_buffer.take_pending();
        if pending.is_empty() {
            return Ok(());
        }
        let out = self.chain.outbound(pending)?;
        self.apply(out);
        Ok(())
    }

    /// Bytes written but not yet handed to the socket.
    pub fn pending_write_size(&self) -> usize {
        self.write_buffer.size() + self.chain.pending_size() + self.socket.pending_size()
    }

    fn autoflush(&mut self) -> Result<(), Error> {
        if self.autoflush {
            self.flush()
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.close_request.is_some() || self.closing {
            return Err(Error::ConnectionClosed);
        }
        // The socket is shut down as soon as end of stream is read.
        if self.socket.is_peer_closed() {
            return Err(Error::PeerClosed);
        }
        match self.socket.state() {
            SocketState::Open | SocketState::Connecting => Ok(()),
            SocketState::Closing | SocketState::Closed => Err(Error::ConnectionClosed),
        }
    }
}

// ============================================================================
// Control Operations
// ============================================================================

impl Connection {
    /// Requests a close. A graceful close (`immediate == false`) first sends
    /// everything already written; an immediate close drops it.
    pub fn close(&mut self, immediate: bool) {
        self.close_request = Some(self.close_request.unwrap_or(false) || immediate);
    }

    /// Stops reading from the socket until [`resume_read`](Self::resume_read).
    pub fn suspend_read(&mut self) {
        if !self.read_suspended {
            debug!(id = self.id, "Read suspended");
        }
        self.read_suspended = true;
    }

    pub fn resume_read(&mut self) {
        if self.read_suspended {
            debug!(id = self.id, "Read resumed");
            self.read_suspended = false;
            self.resume_requested = true;
            // Records received before the suspension are delivered again.
            self.data_ready |= !self.read_buffer.is_empty();
        }
    }

    pub fn is_read_suspended(&self) -> bool {
        self.read_suspended
    }

    /// Paces outbound data. `BytesPerSecond(0)` is treated as unlimited.
    pub fn set_write_transfer_rate(&mut self, rate: TransferRate) -> Result<(), Error> {
        match rate {
            TransferRate::Unlimited | TransferRate::BytesPerSecond(0) => {
                let out = self.chain.remove::<ThrottleStage>()?;
                self.apply(out);
            }
            TransferRate::BytesPerSecond(bytes_per_sec) => {
                match self.chain.get_mut::<ThrottleStage>() {
                    Some(stage) => stage.set_rate(bytes_per_sec),
                    None => self.chain.push(Box::new(ThrottleStage::new(bytes_per_sec))),
                }
                debug!(id = self.id, bytes_per_sec, "Write transfer rate set");
            }
        }
        Ok(())
    }

    pub fn write_transfer_rate(&mut self) -> TransferRate {
        match self.chain.get_mut::<ThrottleStage>() {
            Some(stage) => TransferRate::BytesPerSecond(stage.bytes_per_sec()),
            None => TransferRate::Unlimited,
        }
    }

    /// Switches a [`TlsMode::StartTls`] connection to TLS.
    ///
    /// Everything written so far is flushed as plaintext. Bytes received but
    /// not consumed are handed to the TLS engine as the start of the
    /// handshake, so a ClientHello pipelined behind the upgrade command is not
    /// lost.
    pub fn activate_secured_mode(&mut self) -> Result<(), Error> {
        if !self.chain.contains::<TlsStage>() {
            return Err(Error::TlsNotEnabled);
        }
        self.flush()?;
        self.chain
            .with_stage::<TlsStage, _, _>(|stage, _| stage.pre_start())?;

        self.read_buffer.remove_read_mark();
        let buffered = self.read_buffer.drain();
        info!(id = self.id, reinjected = buffered.len(), "Activating secured mode");
        if let Some(((), out)) = self
            .chain
            .with_stage::<TlsStage, _, _>(|stage, ctx| stage.start(buffered, ctx))?
        {
            self.apply(out);
        }
        Ok(())
    }

    /// Closes the connection when nothing at all was received for `timeout`.
    /// Overrides the dispatcher default.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Closes the connection once it has been open for `timeout`.
    pub fn set_connection_timeout(&mut self, timeout: Option<Duration>) {
        self.connection_timeout = timeout;
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout
    }
}

// ============================================================================
// Dispatcher Side
// ============================================================================

impl Connection {
    pub(crate) fn socket(&self) -> &SocketHandler {
        &self.socket
    }

    pub(crate) fn socket_mut(&mut self) -> &mut SocketHandler {
        &mut self.socket
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    /// Runs once the TCP connection is up. With immediate TLS the handshake
    /// starts here and `on_connect` waits for it.
    pub(crate) fn establish(&mut self) -> Result<(), Error> {
        if self.tls_mode != TlsMode::Immediate {
            self.connect_ready = true;
            return Ok(());
        }
        if let Some(((), out)) = self.chain.with_stage::<TlsStage, _, _>(|stage, ctx| {
            stage.pre_start()?;
            stage.start(Vec::new(), ctx)
        })? {
            self.apply(out);
        }
        Ok(())
    }

    /// Feeds socket data up the stages into the read buffer.
    pub(crate) fn receive(&mut self, data: Vec<Bytes>) -> Result<(), Error> {
        let out = self.chain.inbound(data)?;
        self.apply(out);
        Ok(())
    }

    pub(crate) fn tick(&mut self, now: Instant) -> Result<(), Error> {
        let out = self.chain.tick(now)?;
        self.apply(out);
        Ok(())
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.chain.next_deadline()
    }

    /// Maps buffers the socket wrote to the buffers the application wrote.
    pub(crate) fn written(&mut self, buffers: Vec<Bytes>) -> Vec<Bytes> {
        self.chain.written(buffers)
    }

    /// Starts the close sequence. Returns true when the socket can be closed
    /// right away, false when queued output has to drain first.
    pub(crate) fn begin_close(&mut self, immediate: bool) -> Result<bool, Error> {
        self.closing = true;
        self.close_request = None;
        if immediate {
            self.write_buffer.clear();
            let _ = self.chain.close(true)?;
            return Ok(true);
        }
        let pending = self.write_buffer.take_pending();
        self.write_buffer.clear();
        if !pending.is_empty() {
            let out = self.chain.outbound(pending)?;
            self.apply(out);
        }
        let out = self.chain.close(false)?;
        self.apply(out);
        self.socket.begin_closing();
        Ok(!self.socket.has_pending_output() || self.socket.is_peer_closed())
    }

    pub(crate) fn take_data_ready(&mut self) -> bool {
        std::mem::take(&mut self.data_ready)
    }

    pub(crate) fn take_connect_ready(&mut self) -> bool {
        std::mem::take(&mut self.connect_ready)
    }

    pub(crate) fn take_close_request(&mut self) -> Option<bool> {
        self.close_request.take()
    }

    pub(crate) fn take_resume_requested(&mut self) -> bool {
        std::mem::take(&mut self.resume_requested)
    }

    fn apply(&mut self, out: ChainOutput) {
        if !out.outbound.is_empty() {
            self.socket.enqueue(out.outbound);
        }
        if !out.inbound.is_empty() {
            self.read_buffer.append(out.inbound);
            self.data_ready = true;
        }
        if let Some(immediate) = out.close {
            if !self.closing {
                self.close(immediate);
            }
        }
        for event in out.events {
            match event {
                StageEvent::HandshakeFinished => {
                    self.secured = true;
                    if self.tls_mode == TlsMode::Immediate {
                        self.connect_ready = true;
                    }
                }
            }
        }
    }
}
