//! TLS stage built on rustls.
//!
//! The stage sits next to the socket in a connection's [`IoChain`](crate::chain::IoChain).
//! It starts out `Inactive` and passes bytes through untouched, which is what
//! lets a plaintext connection switch to TLS mid-stream:
//!
//! 1. [`TlsStage::pre_start`] suspends both directions, so plaintext that is
//!    still in flight cannot be mistaken for ciphertext.
//! 2. [`TlsStage::start`] takes the bytes the application had buffered but
//!    not consumed (a pipelined ClientHello), puts them in front of anything
//!    that arrived while pre-armed and begins the handshake.
//! 3. Once the handshake is done the stage emits
//!    [`StageEvent::HandshakeFinished`] and flushes the plaintext written in
//!    the meantime.
//!
//! rustls performs all of its work inside `process_new_packets`, so there is
//! no delegated-task outcome to handle.

mod config;

pub use self::config::{
    build_client_config, build_server_config, load_tls_client_config, load_tls_server_config,
    TlsSettings,
};

use crate::chain::{IoStage, StageContext, StageEvent, WrittenTracker};
use crate::error::Error;
use crate::memory::SynchronizedPool;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Initial size of the plaintext buffer for one unwrap step (one TLS record).
const PLAINTEXT_CHUNK: usize = 16 * 1024;
/// Upper bound for the plaintext buffer after overflow growth.
const MAX_PLAINTEXT_CHUNK: usize = 256 * 1024;

/// How a connection uses TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// No TLS stage.
    #[default]
    Plain,
    /// A TLS stage is installed but stays inactive until
    /// [`Connection::activate_secured_mode`](crate::Connection::activate_secured_mode).
    StartTls,
    /// The handshake starts as soon as the connection is established, and
    /// `on_connect` fires once it has finished.
    Immediate,
}

/// Progress of a TLS stage. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Inactive,
    PreArmed,
    Upgrading,
    Active,
}

impl TlsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsState::Inactive => "inactive",
            TlsState::PreArmed => "pre-armed",
            TlsState::Upgrading => "upgrading",
            TlsState::Active => "active",
        }
    }
}

/// Outcome of one unwrap step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineStatus {
    /// Progress was made, try again.
    Ok,
    /// The engine needs more ciphertext.
    BufferUnderflow,
    /// The plaintext buffer was filled completely.
    BufferOverflow,
    /// The peer sent close_notify.
    Closed,
}

// Internal enum for TLS connection type
enum TlsConnection {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, rd: &mut dyn Read) -> Result<usize, io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.read_tls(rd),
            TlsConnection::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> Result<usize, io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.write_tls(wr),
            TlsConnection::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnection::Server(conn) => conn.process_new_packets(),
            TlsConnection::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.wants_write(),
            TlsConnection::Client(conn) => conn.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnection::Server(conn) => conn.writer(),
            TlsConnection::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnection::Server(conn) => conn.reader(),
            TlsConnection::Client(conn) => conn.reader(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.is_handshaking(),
            TlsConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Server(conn) => conn.send_close_notify(),
            TlsConnection::Client(conn) => conn.send_close_notify(),
        }
    }

    fn side(&self) -> &'static str {
        match self {
            TlsConnection::Server(_) => "server",
            TlsConnection::Client(_) => "client",
        }
    }
}

pub(crate) struct TlsStage {
    conn: TlsConnection,
    state: TlsState,
    pool: Arc<SynchronizedPool>,
    min_buffer_size: usize,
    // Ciphertext not yet taken by the engine.
    incoming: BytesMut,
    // Socket data that arrived while pre-armed.
    held_inbound: Vec<Bytes>,
    // Application plaintext waiting for the handshake.
    pending_plaintext: VecDeque<Bytes>,
    plaintext_chunk: usize,
    tracker: WrittenTracker,
    close_sent: bool,
}

// ============================================================================
// Constructors
// ============================================================================

impl TlsStage {
    pub(crate) fn server(
        config: Arc<ServerConfig>,
        pool: Arc<SynchronizedPool>,
        min_buffer_size: usize,
    ) -> Result<Self, Error> {
        let conn =
            ServerConnection::new(config).map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
        Ok(Self::new(TlsConnection::Server(conn), pool, min_buffer_size))
    }

    pub(crate) fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        pool: Arc<SynchronizedPool>,
        min_buffer_size: usize,
    ) -> Result<Self, Error> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;
        Ok(Self::new(TlsConnection::Client(conn), pool, min_buffer_size))
    }

    fn new(conn: TlsConnection, pool: Arc<SynchronizedPool>, min_buffer_size: usize) -> Self {
        Self {
            conn,
            state: TlsState::Inactive,
            pool,
            min_buffer_size,
            incoming: BytesMut::new(),
            held_inbound: Vec::new(),
            pending_plaintext: VecDeque::new(),
            plaintext_chunk: PLAINTEXT_CHUNK,
            tracker: WrittenTracker::default(),
            close_sent: false,
        }
    }
}

// ============================================================================
// State Transitions
// ============================================================================

impl TlsStage {
    pub(crate) fn state(&self) -> TlsState {
        self.state
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == TlsState::Active
    }

    /// Suspends inbound delivery and outbound flushing ahead of [`start`](Self::start).
    pub(crate) fn pre_start(&mut self) -> Result<(), Error> {
        if self.state != TlsState::Inactive {
            return Err(Error::TlsInvalidState {
                operation: "pre-start",
                state: self.state.as_str(),
            });
        }
        self.state = TlsState::PreArmed;
        debug!(side = self.conn.side(), "TLS pre-armed");
        Ok(())
    }

    /// Begins the handshake. `buffered` holds bytes already read from the
    /// socket, which are fed to the engine before anything received later.
    pub(crate) fn start(&mut self, buffered: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error> {
        if self.state != TlsState::PreArmed {
            return Err(Error::TlsInvalidState {
                operation: "start",
                state: self.state.as_str(),
            });
        }
        self.state = TlsState::Upgrading;
        let reinjected: usize = buffered.iter().map(Bytes::len).sum();
        debug!(side = self.conn.side(), reinjected, "TLS handshake started");

        let held = std::mem::take(&mut self.held_inbound);
        for buffer in buffered.iter().chain(held.iter()) {
            self.incoming.extend_from_slice(buffer);
        }
        self.unwrap(ctx)
    }
}

// ============================================================================
// Engine I/O
// ============================================================================

impl TlsStage {
    fn unwrap(&mut self, ctx: &mut StageContext) -> Result<(), Error> {
        loop {
            match self.unwrap_step(ctx)? {
                EngineStatus::Ok => {}
                EngineStatus::BufferUnderflow => break,
                EngineStatus::BufferOverflow => {
                    self.plaintext_chunk = (self.plaintext_chunk * 2).min(MAX_PLAINTEXT_CHUNK);
                }
                EngineStatus::Closed => {
                    debug!(side = self.conn.side(), "TLS close_notify received");
                    ctx.request_close(false);
                    break;
                }
            }
        }

        self.write_tls(None, ctx)?;
        if self.state == TlsState::Upgrading && !self.conn.is_handshaking() {
            self.state = TlsState::Active;
            info!(side = self.conn.side(), "TLS handshake finished");
            ctx.emit(StageEvent::HandshakeFinished);
            self.wrap_pending(ctx)?;
        }
        Ok(())
    }

    fn unwrap_step(&mut self, ctx: &mut StageContext) -> Result<EngineStatus, Error> {
        let mut consumed = 0;
        // An empty reader would signal end of stream to the engine.
        if !self.incoming.is_empty() {
            let mut input: &[u8] = &self.incoming;
            consumed = self.conn.read_tls(&mut input)?;
            self.incoming.advance(consumed);

            if let Err(err) = self.conn.process_new_packets() {
                warn!(side = self.conn.side(), %err, "TLS engine failure");
                // Let the alert go out before the connection closes.
                let _ = self.write_tls(None, ctx);
                return Err(Error::TlsHandshake(err.to_string()));
            }
        }

        let mut plain = self.pool.acquire(self.plaintext_chunk);
        plain.resize(self.plaintext_chunk, 0);
        match self.conn.reader().read(&mut plain[..]) {
            Ok(0) => {
                self.pool.recycle(plain, self.min_buffer_size);
                Ok(EngineStatus::Closed)
            }
            Ok(n) => {
                trace!(len = n, side = self.conn.side(), "Decrypted data");
                let full = n == plain.len();
                ctx.deliver(self.pool.extract_and_recycle(plain, n, self.min_buffer_size));
                Ok(if full {
                    EngineStatus::BufferOverflow
                } else {
                    EngineStatus::Ok
                })
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.pool.recycle(plain, self.min_buffer_size);
                Ok(if consumed > 0 && !self.incoming.is_empty() {
                    EngineStatus::Ok
                } else {
                    EngineStatus::BufferUnderflow
                })
            }
            Err(err) => {
                self.pool.recycle(plain, self.min_buffer_size);
                Err(Error::TlsHandshake(err.to_string()))
            }
        }
    }

    fn wrap_pending(&mut self, ctx: &mut StageContext) -> Result<(), Error> {
        while let Some(plain) = self.pending_plaintext.pop_front() {
            self.wrap(plain, ctx)?;
        }
        Ok(())
    }

    fn wrap(&mut self, plain: Bytes, ctx: &mut StageContext) -> Result<(), Error> {
        let mut offset = 0;
        let mut produced = 0;
        while offset < plain.len() {
            let n = self.conn.writer().write(&plain[offset..])?;
            offset += n;
            // Drain the engine so its send buffer limit never stalls the write.
            produced += self.drain_tls(ctx)?;
            if n == 0 && produced == 0 {
                return Err(Error::TlsHandshake(
                    "engine accepted no plaintext".to_string(),
                ));
            }
        }
        trace!(len = plain.len(), produced, side = self.conn.side(), "Encrypted data");
        self.tracker.record(Some(plain), produced);
        Ok(())
    }

    // Sends everything the engine wants to write and records it under `source`.
    fn write_tls(&mut self, source: Option<Bytes>, ctx: &mut StageContext) -> Result<usize, Error> {
        let produced = self.drain_tls(ctx)?;
        self.tracker.record(source, produced);
        Ok(produced)
    }

    fn drain_tls(&mut self, ctx: &mut StageContext) -> Result<usize, Error> {
        let mut produced = 0;
        while self.conn.wants_write() {
            let buffer = self.pool.acquire(self.min_buffer_size);
            let mut writer = buffer.writer();
            let n = self.conn.write_tls(&mut writer)?;
            let buffer = writer.into_inner();
            produced += n;
            ctx.send(self.pool.extract_and_recycle(buffer, n, self.min_buffer_size));
            if n == 0 {
                break;
            }
        }
        Ok(produced)
    }
}

// ============================================================================
// Stage
// ============================================================================

impl IoStage for TlsStage {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn on_inbound(&mut self, data: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error> {
        match self.state {
            TlsState::Inactive => {
                for buffer in data {
                    ctx.deliver(buffer);
                }
                Ok(())
            }
            TlsState::PreArmed => {
                self.held_inbound.extend(data);
                Ok(())
            }
            TlsState::Upgrading | TlsState::Active => {
                for buffer in &data {
                    self.incoming.extend_from_slice(buffer);
                }
                self.unwrap(ctx)
            }
        }
    }

    fn on_outbound(&mut self, data: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error> {
        if self.close_sent {
            debug!(side = self.conn.side(), "Dropping write after close_notify");
            return Ok(());
        }
        match self.state {
            TlsState::Inactive => {
                for buffer in data {
                    self.tracker.record(Some(buffer.clone()), buffer.len());
                    ctx.send(buffer);
                }
                Ok(())
            }
            TlsState::PreArmed | TlsState::Upgrading => {
                self.pending_plaintext.extend(data);
                Ok(())
            }
            TlsState::Active => {
                for buffer in data {
                    self.wrap(buffer, ctx)?;
                }
                Ok(())
            }
        }
    }

    fn on_written(&mut self, written: Vec<Bytes>) -> Vec<Bytes> {
        self.tracker.map(written)
    }

    fn on_close(&mut self, immediate: bool, ctx: &mut StageContext) -> Result<(), Error> {
        if immediate {
            self.pending_plaintext.clear();
            self.tracker.clear();
            return Ok(());
        }
        if self.close_sent {
            return Ok(());
        }
        match self.state {
            TlsState::Active => {
                self.wrap_pending(ctx)?;
                self.conn.send_close_notify();
                self.close_sent = true;
                self.write_tls(None, ctx)?;
            }
            TlsState::Upgrading => {
                if !self.pending_plaintext.is_empty() {
                    debug!(
                        count = self.pending_plaintext.len(),
                        "Dropping plaintext written during an unfinished handshake"
                    );
                    self.pending_plaintext.clear();
                }
                self.conn.send_close_notify();
                self.close_sent = true;
                self.write_tls(None, ctx)?;
            }
            TlsState::Inactive | TlsState::PreArmed => {}
        }
        Ok(())
    }

    fn pending_size(&self) -> usize {
        self.pending_plaintext.iter().map(Bytes::len).sum()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    fn stages() -> (TlsStage, TlsStage) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert: CertificateDer<'static> = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let server_config = Arc::new(build_server_config(vec![cert.clone()], key).unwrap());
        let client_config = Arc::new(build_client_config(vec![cert]).unwrap());
        let pool = Arc::new(SynchronizedPool::new(16 * 1024, 8));

        let server = TlsStage::server(server_config, pool.clone(), 64).unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let client = TlsStage::client(client_config, name, pool, 64).unwrap();
        (client, server)
    }

    fn joined(buffers: &[Bytes]) -> Vec<u8> {
        buffers.iter().flat_map(|b| b.iter().copied()).collect()
    }

    // Shuttles ciphertext between the two stages until neither has anything
    // left to say. Returns the plaintext each side received.
    fn pump(
        client: &mut TlsStage,
        server: &mut TlsStage,
        mut to_server: Vec<Bytes>,
    ) -> (Vec<Bytes>, Vec<Bytes>, Vec<StageEvent>) {
        let mut client_got = Vec::new();
        let mut server_got = Vec::new();
        let mut events = Vec::new();
        for _ in 0..16 {
            if to_server.is_empty() {
                break;
            }
            let mut sctx = StageContext::default();
            server.on_inbound(to_server, &mut sctx).unwrap();
            server_got.extend(sctx.take_inbound());
            events.extend(sctx.take_events());

            let to_client = sctx.take_outbound();
            let mut cctx = StageContext::default();
            if !to_client.is_empty() {
                client.on_inbound(to_client, &mut cctx).unwrap();
            }
            client_got.extend(cctx.take_inbound());
            events.extend(cctx.take_events());
            to_server = cctx.take_outbound();
        }
        (client_got, server_got, events)
    }

    fn start(stage: &mut TlsStage) -> Vec<Bytes> {
        let mut ctx = StageContext::default();
        stage.pre_start().unwrap();
        stage.start(Vec::new(), &mut ctx).unwrap();
        ctx.take_outbound()
    }

    #[test]
    fn handshake_then_exchange() {
        let (mut client, mut server) = stages();
        let hello = start(&mut client);
        assert!(!hello.is_empty());
        start(&mut server);

        let (_, _, events) = pump(&mut client, &mut server, hello);
        assert!(client.is_active());
        assert!(server.is_active());
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == StageEvent::HandshakeFinished)
                .count(),
            2
        );

        let mut ctx = StageContext::default();
        client
            .on_outbound(vec![Bytes::from_static(b"ping")], &mut ctx)
            .unwrap();
        let ciphertext = ctx.take_outbound();
        assert_ne!(joined(&ciphertext), b"ping");

        let mut sctx = StageContext::default();
        server.on_inbound(ciphertext, &mut sctx).unwrap();
        assert_eq!(joined(&sctx.take_inbound()), b"ping");
    }

    #[test]
    fn transitions_are_checked() {
        let (mut client, _) = stages();
        let mut ctx = StageContext::default();
        assert!(matches!(
            client.start(Vec::new(), &mut ctx),
            Err(Error::TlsInvalidState { operation: "start", .. })
        ));
        client.pre_start().unwrap();
        assert!(matches!(
            client.pre_start(),
            Err(Error::TlsInvalidState { operation: "pre-start", .. })
        ));
        assert_eq!(client.state(), TlsState::PreArmed);
    }

    #[test]
    fn inactive_stage_passes_plaintext_through() {
        let (_, mut server) = stages();
        let mut ctx = StageContext::default();
        server
            .on_inbound(vec![Bytes::from_static(b"EHLO\r\n")], &mut ctx)
            .unwrap();
        assert_eq!(joined(&ctx.take_inbound()), b"EHLO\r\n");

        let written = Bytes::from_static(b"250 OK\r\n");
        server.on_outbound(vec![written.clone()], &mut ctx).unwrap();
        assert_eq!(ctx.take_outbound(), vec![written.clone()]);
        assert_eq!(server.on_written(vec![written.clone()]), vec![written]);
    }

    #[test]
    fn buffered_bytes_are_fed_before_held_bytes() {
        let (mut client, mut server) = stages();
        let hello = joined(&start(&mut client));
        let (first, second) = hello.split_at(hello.len() / 2);

        server.pre_start().unwrap();
        let mut ctx = StageContext::default();
        // Arrives after pre-arming but was sent after the buffered part.
        server
            .on_inbound(vec![Bytes::copy_from_slice(second)], &mut ctx)
            .unwrap();
        assert!(ctx.take_inbound().is_empty());
        assert!(ctx.take_outbound().is_empty());

        server
            .start(vec![Bytes::copy_from_slice(first)], &mut ctx)
            .unwrap();
        assert_eq!(server.state(), TlsState::Upgrading);
        let server_hello = ctx.take_outbound();
        assert!(!server_hello.is_empty());

        let mut cctx = StageContext::default();
        client.on_inbound(server_hello, &mut cctx).unwrap();
        pump(&mut client, &mut server, cctx.take_outbound());
        assert!(server.is_active());
    }

    #[test]
    fn writes_wait_for_the_handshake() {
        let (mut client, mut server) = stages();
        let hello = start(&mut client);
        start(&mut server);

        let early = Bytes::from_static(b"early data");
        let mut ctx = StageContext::default();
        client.on_outbound(vec![early.clone()], &mut ctx).unwrap();
        assert!(ctx.take_outbound().is_empty());
        assert_eq!(client.pending_size(), early.len());

        let (_, server_got, _) = pump(&mut client, &mut server, hello);
        assert_eq!(joined(&server_got), b"early data");
        assert_eq!(client.pending_size(), 0);
    }

    #[test]
    fn close_notify_requests_graceful_close() {
        let (mut client, mut server) = stages();
        let hello = start(&mut client);
        start(&mut server);
        pump(&mut client, &mut server, hello);

        let mut ctx = StageContext::default();
        client.on_close(false, &mut ctx).unwrap();
        let notify = ctx.take_outbound();
        assert!(!notify.is_empty());

        let mut sctx = StageContext::default();
        server.on_inbound(notify, &mut sctx).unwrap();
        assert_eq!(sctx.close_requested(), Some(false));
    }
}
