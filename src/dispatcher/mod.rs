//! The reactor.
//!
//! A [`Dispatcher`] owns a mio `Poll`, its listeners and every connection
//! registered with it, and runs all of their I/O and all application
//! callbacks on the thread that calls [`Dispatcher::run`] or
//! [`Dispatcher::poll_once`]. Other threads talk to it through a
//! [`DispatcherInterface`].
//!
//! For every ready connection the dispatcher reads before it writes. After
//! each event, request or timer it settles the connection: connect
//! notification, `on_data`, close handling, flushing the write queue and
//! finally updating the mio interest to match what the connection still
//! needs.

mod interface;
mod timeout;

pub use interface::DispatcherInterface;

use crate::chain::IoChain;
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::handler::{panic_message, Handler, HandlerFactory};
use crate::memory::{SynchronizedPool, UnsynchronizedPool};
use crate::socket::write_task::WriteTaskArena;
use crate::socket::SocketHandler;
use crate::tls::{TlsMode, TlsSettings, TlsStage};
use ::config::Config;
use bytes::Bytes;
use interface::{resolve, Request};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use timeout::TimeoutTimer;
use tracing::{debug, error, info, instrument, trace, warn};

// Internal constants for connection management
const WAKE_ID: usize = 2;
const CONNECTION_ID_RANGE_START: usize = 1000;
// Rounds of settling after a resumed read.
const MAX_SETTLE_ROUNDS: usize = 8;

// Ids are unique per process, not only per dispatcher.
static NEXT_ID: AtomicUsize = AtomicUsize::new(CONNECTION_ID_RANGE_START);

fn next_id() -> usize {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Counters of one dispatcher. Shared, so they can be read from any thread.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    idle_timeouts: AtomicU64,
    connection_timeouts: AtomicU64,
}

impl DispatcherStats {
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    pub fn deregistrations(&self) -> u64 {
        self.deregistrations.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn idle_timeouts(&self) -> u64 {
        self.idle_timeouts.load(Ordering::Relaxed)
    }

    pub fn connection_timeouts(&self) -> u64 {
        self.connection_timeouts.load(Ordering::Relaxed)
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

struct Listener {
    listener: TcpListener,
    factory: Box<dyn HandlerFactory>,
    tls_mode: TlsMode,
}

// A connection together with its handler and its mio registration.
struct Registration {
    conn: Connection,
    handler: Box<dyn Handler>,
    interest: Option<Interest>,
    outbound: bool,
    eof: bool,
    failure: Option<Error>,
}

/// Event loop for many non-blocking TCP connections.
///
/// Not thread-safe, but `Send`: build it, set up listeners, then move it to
/// the thread that runs it. Use a [`DispatcherInterface`] from other threads.
///
/// # Configuration Keys
///
/// Looked up as `name.key`, then `key`:
///
/// - `poll_capacity`, `preallocation_size`, `min_buffer_size`,
///   `shared_pool_capacity`, `max_read_size`, `max_connections`
/// - `idle_timeout_ms`, `connection_timeout_ms`, `timeout_check_period_ms`
/// - `tls_server_cert`, `tls_server_key`, `tls_ca_cert`, `tls_server_name`
pub struct Dispatcher {
    config: EngineConfig,
    tls: TlsSettings,
    poll: Poll,
    waker: Arc<Waker>,
    sender: Sender<Request>,
    receiver: Receiver<Request>,
    registrations: HashMap<usize, Registration>,
    listeners: HashMap<usize, Listener>,
    // Connections with a stage timer pending.
    timed: HashSet<usize>,
    pool: UnsynchronizedPool,
    shared_pool: Arc<SynchronizedPool>,
    arena: WriteTaskArena,
    stats: Arc<DispatcherStats>,
    timer: Option<TimeoutTimer>,
    shutdown_requested: bool,
}

// ============================================================================
// Constructors
// ============================================================================

impl Dispatcher {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a dispatcher whose configuration keys are looked up under
    /// `name` first.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let engine = EngineConfig::from_config(config, name)?;
        let tls = TlsSettings::from_config(config, name)?;
        Self::with_settings(engine, tls)
    }

    pub fn with_settings(config: EngineConfig, tls: TlsSettings) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(WAKE_ID))?);
        let (sender, receiver) = channel();
        let shared_pool = Arc::new(SynchronizedPool::new(
            config.preallocation_size,
            config.shared_pool_capacity,
        ));

        debug!(?config, ?tls, "Dispatcher created");
        Ok(Self {
            pool: UnsynchronizedPool::new(config.preallocation_size),
            config,
            tls,
            poll,
            waker,
            sender,
            receiver,
            registrations: HashMap::new(),
            listeners: HashMap::new(),
            timed: HashSet::new(),
            shared_pool,
            arena: WriteTaskArena::new(),
            stats: Arc::new(DispatcherStats::default()),
            timer: None,
            shutdown_requested: false,
        })
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl Dispatcher {
    /// Listens on `addr`; every accepted connection gets a handler from
    /// `factory`. Returns the listener id and the bound address.
    #[instrument(skip(self, addr, factory))]
    pub fn listen<A, F>(
        &mut self,
        addr: A,
        factory: F,
        tls_mode: TlsMode,
    ) -> Result<(usize, SocketAddr), Error>
    where
        A: ToSocketAddrs,
        F: HandlerFactory + 'static,
    {
        let addr = resolve(addr)?;
        self.listen_impl(addr, Box::new(factory), tls_mode)
    }

    /// Opens an outbound connection handled by `handler` and returns its id.
    ///
    /// The connect completes in the event loop. `on_connect` or
    /// `on_connect_exception` reports the outcome.
    #[instrument(skip(self, addr, handler))]
    pub fn connect<A, H>(&mut self, addr: A, handler: H, tls_mode: TlsMode) -> Result<usize, Error>
    where
        A: ToSocketAddrs,
        H: Handler + 'static,
    {
        let addr = resolve(addr)?;
        self.connect_impl(addr, Box::new(handler), tls_mode)
    }

    pub fn close_listener(&mut self, id: usize) -> Result<(), Error> {
        let mut listener = self
            .listeners
            .remove(&id)
            .ok_or(Error::ListenerNotFound { id })?;
        if let Err(err) = self.poll.registry().deregister(&mut listener.listener) {
            debug!(id, ?err, "Failed to deregister listener");
        }
        info!(id, "Listener closed");
        Ok(())
    }

    /// Closes one connection immediately.
    pub fn close(&mut self, id: usize) -> Result<(), Error> {
        if !self.registrations.contains_key(&id) {
            return Err(Error::ConnectionNotFound { id });
        }
        self.close_connection(id, None);
        Ok(())
    }

    /// Closes all listeners and connections. Every connection that was
    /// connected gets its `on_disconnect`.
    pub fn close_all(&mut self) {
        let listener_ids: Vec<usize> = self.listeners.keys().copied().collect();
        for id in listener_ids {
            let _ = self.close_listener(id);
        }
        let ids: Vec<usize> = self.registrations.keys().copied().collect();
        for id in ids {
            self.close_connection(id, None);
        }
    }

    /// Queues `data` for connection `id` from the dispatcher thread.
    pub fn write(&mut self, id: usize, data: impl Into<Bytes>) -> Result<(), Error> {
        let reg = self
            .registrations
            .get_mut(&id)
            .ok_or(Error::ConnectionNotFound { id })?;
        reg.conn.write_bytes(data.into())?;
        self.settle(id);
        Ok(())
    }

    /// Runs `f` on the connection `id` outside of any callback and settles it
    /// afterwards.
    pub fn with_connection<R, F>(&mut self, id: usize, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Connection) -> R,
    {
        let reg = self
            .registrations
            .get_mut(&id)
            .ok_or(Error::ConnectionNotFound { id })?;
        let result = f(&mut reg.conn);
        self.settle(id);
        Ok(result)
    }

    fn listen_impl(
        &mut self,
        addr: SocketAddr,
        factory: Box<dyn HandlerFactory>,
        tls_mode: TlsMode,
    ) -> Result<(usize, SocketAddr), Error> {
        if tls_mode != TlsMode::Plain && !self.tls.has_server() {
            return Err(Error::TlsServerConfigMissing);
        }

        let mut listener = TcpListener::bind(addr)?;
        let id = next_id();
        let local_addr = listener.local_addr()?;
        self.poll
            .registry()
            .register(&mut listener, Token(id), Interest::READABLE)?;
        info!(id, %local_addr, ?tls_mode, "Listening for connections");

        self.listeners.insert(
            id,
            Listener {
                listener,
                factory,
                tls_mode,
            },
        );
        Ok((id, local_addr))
    }

    fn connect_impl(
        &mut self,
        peer_addr: SocketAddr,
        handler: Box<dyn Handler>,
        tls_mode: TlsMode,
    ) -> Result<usize, Error> {
        if tls_mode != TlsMode::Plain && !self.tls.has_client() {
            return Err(Error::TlsClientConfigMissing);
        }
        if let Some(max) = self.config.max_connections {
            if self.registrations.len() >= max {
                return Err(Error::MaxConnectionsReached { max });
            }
        }

        let chain = self.build_chain(tls_mode, true)?;
        let stream = TcpStream::connect(peer_addr)?;
        let socket = SocketHandler::connecting(
            stream,
            peer_addr,
            self.config.preallocation_size,
            self.config.min_buffer_size,
        )?;

        let id = next_id();
        info!(id, local_addr = %socket.local_addr(), %peer_addr, "Initiating connection");
        self.register(id, socket, chain, handler, tls_mode, true);
        Ok(id)
    }

    fn build_chain(&self, tls_mode: TlsMode, outbound: bool) -> Result<IoChain, Error> {
        let mut chain = IoChain::new();
        if tls_mode == TlsMode::Plain {
            return Ok(chain);
        }
        let pool = self.shared_pool.clone();
        let min = self.config.min_buffer_size;
        let stage = if outbound {
            TlsStage::client(self.tls.client_config()?, self.tls.server_name()?, pool, min)?
        } else {
            TlsStage::server(self.tls.server_config()?, pool, min)?
        };
        // TLS sits next to the socket; throttling goes above it.
        chain.insert(0, Box::new(stage));
        Ok(chain)
    }

    fn register(
        &mut self,
        id: usize,
        socket: SocketHandler,
        chain: IoChain,
        handler: Box<dyn Handler>,
        tls_mode: TlsMode,
        outbound: bool,
    ) {
        let mut conn = Connection::new(id, socket, chain, tls_mode, self.config.max_read_size);
        conn.set_idle_timeout(self.config.idle_timeout);
        conn.set_connection_timeout(self.config.connection_timeout);

        let failure = if outbound {
            None
        } else {
            conn.establish().err()
        };
        self.registrations.insert(
            id,
            Registration {
                conn,
                handler,
                interest: None,
                outbound,
                eof: false,
                failure,
            },
        );
        DispatcherStats::add(&self.stats.registrations, 1);
        self.settle(id);
    }
}

// ============================================================================
// Event Loop
// ============================================================================

impl Dispatcher {
    /// Runs until [`DispatcherInterface::shutdown`] is called, then closes
    /// everything.
    pub fn run(&mut self) -> Result<(), Error> {
        info!("Dispatcher running");
        while !self.shutdown_requested {
            self.poll_once(None)?;
        }
        self.close_all();
        info!("Dispatcher stopped");
        Ok(())
    }

    /// Waits for events for at most `timeout` (`None` waits until something
    /// happens) and handles them. Returns the number of mio events handled.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        self.process_requests();

        let timeout = match (timeout, self.stage_wait(Instant::now())) {
            (Some(limit), Some(wait)) => Some(limit.min(wait)),
            (limit, wait) => limit.or(wait),
        };

        let mut events = Events::with_capacity(self.config.poll_capacity);
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err.into()),
        }

        let mut handled = 0;
        for event in events.iter() {
            let Token(id) = event.token();
            handled += 1;

            if id == WAKE_ID {
                // Requests are processed below
                continue;
            }
            if self.listeners.contains_key(&id) {
                self.accept_connections(id);
                continue;
            }
            if !self.registrations.contains_key(&id) {
                // Closed earlier in this pass
                continue;
            }

            if event.is_readable() || event.is_read_closed() {
                self.read_connection(id);
            }
            if event.is_writable() || event.is_error() {
                self.writable_connection(id);
            }
            self.settle(id);
        }

        self.process_requests();
        self.run_stage_timers(Instant::now());
        Ok(handled)
    }

    /// A thread-safe handle for this dispatcher.
    pub fn interface(&self) -> DispatcherInterface {
        DispatcherInterface {
            sender: self.sender.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.stats.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// The pool that TLS output buffers come from.
    pub fn shared_pool(&self) -> Arc<SynchronizedPool> {
        self.shared_pool.clone()
    }

    fn stage_wait(&self, now: Instant) -> Option<Duration> {
        self.timed
            .iter()
            .filter_map(|id| self.registrations.get(id))
            .filter_map(|reg| reg.conn.next_deadline())
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn process_requests(&mut self) {
        let requests: Vec<Request> = self.receiver.try_iter().collect();

        for request in requests {
            match request {
                Request::Connect {
                    addr,
                    tls_mode,
                    handler,
                    response,
                } => {
                    let result = self.connect_impl(addr, handler, tls_mode);
                    if let Err(e) = response.send(result) {
                        error!("Failed to send connect response: {:?}", e);
                    }
                }
                Request::Listen {
                    addr,
                    tls_mode,
                    factory,
                    response,
                } => {
                    let result = self.listen_impl(addr, factory, tls_mode);
                    if let Err(e) = response.send(result) {
                        error!("Failed to send listen response: {:?}", e);
                    }
                }
                Request::Close { id, immediate } => {
                    self.with_registered(id, |conn| conn.close(immediate));
                }
                Request::CloseListener { id } => {
                    if let Err(err) = self.close_listener(id) {
                        debug!(id, %err, "Close listener request ignored");
                    }
                }
                Request::Shutdown => {
                    info!("Shutdown requested");
                    self.shutdown_requested = true;
                }
                Request::Write { id, data } => {
                    self.with_registered(id, |conn| {
                        if let Err(err) = conn.write_bytes(data) {
                            warn!(id, %err, "Queued write failed");
                        }
                    });
                }
                Request::SuspendRead { id } => {
                    self.with_registered(id, Connection::suspend_read);
                }
                Request::ResumeRead { id } => {
                    self.with_registered(id, Connection::resume_read);
                }
                Request::SetWriteTransferRate { id, rate } => {
                    self.with_registered(id, |conn| {
                        if let Err(err) = conn.set_write_transfer_rate(rate) {
                            warn!(id, %err, "Setting write transfer rate failed");
                        }
                    });
                }
                Request::CheckTimeouts => self.check_timeouts(),
            }
        }
    }

    fn with_registered<F: FnOnce(&mut Connection)>(&mut self, id: usize, f: F) {
        match self.registrations.get_mut(&id) {
            Some(reg) => {
                f(&mut reg.conn);
                self.settle(id);
            }
            None => debug!(id, "Request for unknown connection ignored"),
        }
    }

    fn run_stage_timers(&mut self, now: Instant) {
        let due: Vec<usize> = self
            .timed
            .iter()
            .copied()
            .filter(|id| {
                self.registrations
                    .get(id)
                    .and_then(|reg| reg.conn.next_deadline())
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect();

        for id in due {
            if let Some(reg) = self.registrations.get_mut(&id) {
                if let Err(err) = reg.conn.tick(now) {
                    reg.failure = Some(err);
                }
            }
            self.settle(id);
        }
    }
}

// ============================================================================
// Internal Connection I/O
// ============================================================================

impl Dispatcher {
    #[instrument(skip(self))]
    fn accept_connections(&mut self, id: usize) {
        loop {
            let Some(listener) = self.listeners.get_mut(&id) else {
                return;
            };
            let (stream, peer_addr) = match listener.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => return,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        error!(?err, "Failed to accept connection");
                        return;
                    }
                },
            };

            if let Some(max) = self.config.max_connections {
                if self.registrations.len() >= max {
                    warn!(%peer_addr, max, "Connection limit reached, dropping connection");
                    continue;
                }
            }

            let handler = listener.factory.create();
            let tls_mode = listener.tls_mode;
            let socket = match SocketHandler::accepted(
                stream,
                self.config.preallocation_size,
                self.config.min_buffer_size,
            ) {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(%peer_addr, %err, "Failed to set up accepted connection");
                    continue;
                }
            };
            let chain = match self.build_chain(tls_mode, false) {
                Ok(chain) => chain,
                Err(err) => {
                    error!(%peer_addr, %err, "Failed to set up connection stages");
                    continue;
                }
            };

            let conn_id = next_id();
            info!(id = conn_id, local_addr = %socket.local_addr(), %peer_addr, "Accepted connection");
            self.register(conn_id, socket, chain, handler, tls_mode, false);
        }
    }

    fn read_connection(&mut self, id: usize) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };
        let conn = &mut reg.conn;
        if conn.socket().is_connecting()
            || conn.is_read_suspended()
            || conn.is_closing()
            || conn.socket().is_peer_closed()
        {
            return;
        }

        let outcome = conn.socket_mut().read(&mut self.pool);
        DispatcherStats::add(&self.stats.reads, 1);
        DispatcherStats::add(&self.stats.bytes_received, outcome.len() as u64);

        if !outcome.data.is_empty() {
            if let Err(err) = conn.receive(outcome.data) {
                reg.failure.get_or_insert(err);
            }
        }
        if let Some(err) = outcome.error {
            reg.failure.get_or_insert(Error::Io(err));
        }
        if outcome.peer_closed {
            reg.eof = true;
        }
    }

    fn writable_connection(&mut self, id: usize) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };
        if !reg.conn.socket().is_connecting() {
            // Output is flushed while settling
            return;
        }
        match reg.conn.socket_mut().finish_connect() {
            Ok(true) => {
                info!(id, local_addr = %reg.conn.local_addr(), peer_addr = %reg.conn.peer_addr(), "Connection established");
                if let Err(err) = reg.conn.establish() {
                    reg.failure = Some(err);
                }
            }
            Ok(false) => trace!(id, "Connect still in progress"),
            Err(err) => {
                warn!(id, ?err, "Connection failed");
                reg.failure = Some(Error::Io(err));
            }
        }
    }

    // Writes queued output and reports it to the handler.
    fn flush_connection(&mut self, id: usize) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };
        let outcome = reg.conn.socket_mut().write(&mut self.arena);
        if outcome.bytes > 0 {
            DispatcherStats::add(&self.stats.writes, 1);
            DispatcherStats::add(&self.stats.bytes_sent, outcome.bytes as u64);
        }

        let written = if outcome.written.is_empty() {
            Vec::new()
        } else {
            reg.conn.written(outcome.written)
        };
        let failed = outcome
            .failed
            .map(|(err, buffers)| (err, reg.conn.written(buffers)));

        for data in written {
            self.notify(id, "on_written", |handler, conn| handler.on_written(conn, &data));
        }
        if let Some((err, buffers)) = failed {
            for data in &buffers {
                self.notify(id, "on_write_exception", |handler, conn| {
                    handler.on_write_exception(conn, &err, data)
                });
            }
            if let Some(reg) = self.registrations.get_mut(&id) {
                reg.failure.get_or_insert(Error::Io(err));
            }
        }
    }
}

// ============================================================================
// Settling
// ============================================================================

impl Dispatcher {
    fn settle(&mut self, id: usize) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            if !self.settle_once(id) {
                return;
            }
        }
    }

    // Returns true when another round is needed.
    fn settle_once(&mut self, id: usize) -> bool {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return false;
        };

        if reg.conn.take_connect_ready() && reg.conn.socket().mark_connected() {
            debug!(id, "Notifying connect");
            if let Some(Err(err)) = self.notify(id, "on_connect", |h, c| h.on_connect(c)) {
                self.fail(id, err);
            }
        }

        if self.registrations.get_mut(&id).is_some_and(|reg| reg.conn.take_data_ready()) {
            self.deliver_data(id);
        }

        let Some(reg) = self.registrations.get_mut(&id) else {
            return false;
        };
        if let Some(err) = reg.failure.take() {
            self.close_connection(id, Some(err));
            return false;
        }
        if reg.eof {
            debug!(id, "Closing after end of stream");
            self.close_connection(id, None);
            return false;
        }
        if let Some(immediate) = reg.conn.take_close_request() {
            debug!(id, immediate, "Close requested");
            match reg.conn.begin_close(immediate) {
                Ok(true) => {
                    self.close_connection(id, None);
                    return false;
                }
                Ok(false) => {}
                Err(err) => {
                    self.close_connection(id, Some(err));
                    return false;
                }
            }
        }

        if !reg.conn.socket().is_connecting() && reg.conn.socket().has_pending_output() {
            self.flush_connection(id);
        }

        let Some(reg) = self.registrations.get_mut(&id) else {
            return false;
        };
        if let Some(err) = reg.failure.take() {
            self.close_connection(id, Some(err));
            return false;
        }
        if reg.conn.is_closing() && !reg.conn.socket().has_pending_output() {
            self.close_connection(id, None);
            return false;
        }

        let resume = reg.conn.take_resume_requested();
        let timed = reg.conn.next_deadline().is_some();
        let wants_sweep =
            reg.conn.idle_timeout().is_some() || reg.conn.connection_timeout().is_some();

        if timed {
            self.timed.insert(id);
        } else {
            self.timed.remove(&id);
        }
        if wants_sweep {
            self.ensure_timer();
        }
        self.update_interest(id);

        if resume {
            // Edge-triggered readiness may have passed while suspended. The
            // next round delivers what was buffered and what this read adds.
            self.read_connection(id);
            return true;
        }
        false
    }

    fn deliver_data(&mut self, id: usize) {
        loop {
            let Some(before) = self.registrations.get(&id).map(|reg| reg.conn.available()) else {
                return;
            };
            match self.notify(id, "on_data", |h, c| h.on_data(c)) {
                Some(Ok(())) => {}
                Some(Err(err)) if err.is_underflow() => {
                    trace!(id, available = before, "Waiting for more data");
                    return;
                }
                Some(Err(err)) => {
                    self.fail(id, err);
                    return;
                }
                None => return,
            }

            let Some(reg) = self.registrations.get(&id) else {
                return;
            };
            let after = reg.conn.available();
            // Call again while the handler makes progress on what is left.
            if after == 0
                || after >= before
                || reg.conn.is_read_suspended()
                || reg.conn.is_closing()
                || reg.failure.is_some()
            {
                return;
            }
        }
    }

    fn update_interest(&mut self, id: usize) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };

        let conn = &reg.conn;
        let desired = if conn.socket().is_connecting() {
            Some(Interest::WRITABLE)
        } else {
            let read = !conn.is_read_suspended() && !conn.is_closing() && !conn.socket().is_peer_closed();
            let write = conn.socket().has_pending_output();
            match (read, write) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            }
        };
        if desired == reg.interest {
            return;
        }

        let registry = self.poll.registry();
        let stream = reg.conn.socket_mut().stream_mut();
        let result = match (reg.interest, desired) {
            (None, Some(interest)) => registry.register(stream, Token(id), interest),
            (Some(_), Some(interest)) => registry.reregister(stream, Token(id), interest),
            (Some(_), None) => registry.deregister(stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => {
                trace!(id, ?desired, "Interest updated");
                reg.interest = desired;
            }
            Err(err) => {
                warn!(id, ?err, "Failed to update interest");
                reg.failure.get_or_insert(Error::Io(err));
            }
        }
    }

    fn fail(&mut self, id: usize, err: Error) {
        if let Some(reg) = self.registrations.get_mut(&id) {
            warn!(id, %err, "Closing connection after handler error");
            reg.failure.get_or_insert(err);
        }
    }

    // Runs one handler callback; a panic is turned into a failure of this
    // connection only.
    fn notify<R, F>(&mut self, id: usize, callback: &'static str, f: F) -> Option<R>
    where
        F: FnOnce(&mut dyn Handler, &mut Connection) -> R,
    {
        let reg = self.registrations.get_mut(&id)?;
        let conn = &mut reg.conn;
        let handler = &mut reg.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| f(handler.as_mut(), conn))) {
            Ok(result) => Some(result),
            Err(payload) => {
                let message = panic_message(payload);
                error!(id, callback, %message, "Handler panicked");
                reg.failure = Some(Error::HandlerPanicked(message));
                None
            }
        }
    }

    // Tears the connection down once; fires on_disconnect for connected
    // connections and on_connect_exception for failed outbound connects.
    fn close_connection(&mut self, id: usize, err: Option<Error>) {
        let Some(mut reg) = self.registrations.remove(&id) else {
            return;
        };
        self.timed.remove(&id);

        if reg.interest.is_some() {
            if let Err(err) = self.poll.registry().deregister(reg.conn.socket_mut().stream_mut()) {
                debug!(id, ?err, "Failed to deregister connection");
            }
        }
        let state = reg.conn.state().as_str();
        let discarded = reg.conn.socket_mut().close(&mut self.arena);
        DispatcherStats::add(&self.stats.deregistrations, 1);

        match &err {
            Some(err) => info!(id, state, %err, discarded, "Connection closed"),
            None => info!(id, state, discarded, "Connection closed"),
        }

        let Registration {
            mut conn,
            mut handler,
            outbound,
            ..
        } = reg;
        let result = if conn.socket().was_connected() {
            if !conn.socket().mark_disconnected() {
                return;
            }
            panic::catch_unwind(AssertUnwindSafe(|| handler.on_disconnect(&mut conn)))
        } else if outbound {
            let err = err.unwrap_or(Error::ConnectionClosed);
            panic::catch_unwind(AssertUnwindSafe(|| {
                handler.on_connect_exception(&mut conn, &err)
            }))
        } else {
            Ok(())
        };
        if let Err(payload) = result {
            error!(id, message = %panic_message(payload), "Handler panicked while closing");
        }
    }
}

// ============================================================================
// Timeouts
// ============================================================================

impl Dispatcher {
    fn ensure_timer(&mut self) {
        if self.timer.is_some() {
            return;
        }
        match TimeoutTimer::spawn(
            self.config.timeout_check_period,
            self.sender.clone(),
            self.waker.clone(),
        ) {
            Ok(timer) => self.timer = Some(timer),
            Err(err) => error!(%err, "Failed to start timeout timer"),
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut idle = Vec::new();
        let mut stalled = Vec::new();

        for (&id, reg) in &self.registrations {
            let conn = &reg.conn;
            if !conn.socket().was_connected() {
                continue;
            }
            if conn.is_closing() {
                // Nothing is read while draining, so idle counts from the
                // last byte the peer accepted.
                let lifetime = conn
                    .connection_timeout()
                    .is_some_and(|timeout| now.duration_since(conn.opened_at()) >= timeout);
                let progress = conn.last_received().max(conn.socket().last_sent());
                let stuck = conn
                    .idle_timeout()
                    .is_some_and(|timeout| now.duration_since(progress) >= timeout);
                if lifetime || stuck {
                    stalled.push((id, lifetime));
                }
                continue;
            }
            if let Some(timeout) = conn.connection_timeout() {
                if now.duration_since(conn.opened_at()) >= timeout {
                    expired.push(id);
                    continue;
                }
            }
            if let Some(timeout) = conn.idle_timeout() {
                if now.duration_since(conn.last_received()) >= timeout {
                    idle.push(id);
                }
            }
        }

        for id in expired {
            DispatcherStats::add(&self.stats.connection_timeouts, 1);
            let handled = self
                .notify(id, "on_connection_timeout", |h, c| h.on_connection_timeout(c))
                .unwrap_or(false);
            if let Some(reg) = self.registrations.get_mut(&id) {
                if handled {
                    debug!(id, "Connection timeout handled");
                    reg.conn.set_connection_timeout(None);
                } else {
                    info!(id, "Connection timeout");
                    reg.conn.close(false);
                }
            }
            self.settle(id);
        }

        for id in idle {
            DispatcherStats::add(&self.stats.idle_timeouts, 1);
            let handled = self
                .notify(id, "on_idle_timeout", |h, c| h.on_idle_timeout(c))
                .unwrap_or(false);
            if let Some(reg) = self.registrations.get_mut(&id) {
                if handled {
                    debug!(id, "Idle timeout handled");
                    reg.conn.socket_mut().touch_received(now);
                } else {
                    info!(id, "Idle timeout");
                    reg.conn.close(false);
                }
            }
            self.settle(id);
        }

        for (id, lifetime) in stalled {
            let counter = if lifetime {
                &self.stats.connection_timeouts
            } else {
                &self.stats.idle_timeouts
            };
            DispatcherStats::add(counter, 1);
            info!(id, lifetime, "Timeout while closing, dropping queued output");
            self.close_connection(id, None);
        }

        self.shared_pool.shrink();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close_all();
    }
}
