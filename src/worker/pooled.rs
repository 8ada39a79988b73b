use super::{Job, SerializedQueue, WorkerPool};
use crate::connection::{Connection, TransferRate};
use crate::dispatcher::DispatcherInterface;
use crate::error::Error;
use crate::framing::ReadBuffer;
use crate::handler::Handler;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// How the callbacks of one connection are scheduled on the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serialization {
    /// At most one callback of the connection runs at a time, in the order
    /// the dispatcher produced them.
    #[default]
    PerConnection,
    /// Every callback is a separate pool job. Callbacks of one connection may
    /// overlap and finish out of order.
    Unordered,
}

/// Callbacks of a connection whose handler runs on a [`WorkerPool`].
///
/// Methods take `&self` because the handler is shared with the worker
/// threads. Per-connection state needs interior mutability; under
/// [`Serialization::PerConnection`] a `Mutex` around it is never contended.
pub trait PooledHandler: Send + Sync + 'static {
    fn on_connect(&self, _conn: &WorkerConnection) -> Result<(), Error> {
        Ok(())
    }

    /// Received bytes were appended to the read buffer of `conn`.
    /// [`Error::BufferUnderflow`] waits for more data, any other error closes
    /// the connection.
    fn on_data(&self, conn: &WorkerConnection) -> Result<(), Error>;

    fn on_disconnect(&self, _conn: &WorkerConnection) {}

    fn on_connect_exception(&self, _conn: &WorkerConnection, _reason: &str) {}

    /// Return `true` to keep the connection open.
    fn on_idle_timeout(&self, _conn: &WorkerConnection) -> bool {
        false
    }

    /// Return `true` to keep the connection open.
    fn on_connection_timeout(&self, _conn: &WorkerConnection) -> bool {
        false
    }
}

/// The worker side of a connection.
///
/// Reads come from bytes the dispatcher already received; everything else is
/// a request queued to the dispatcher, which carries it out on its own
/// thread.
pub struct WorkerConnection {
    id: usize,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    secure: bool,
    open: AtomicBool,
    read_buffer: Mutex<ReadBuffer>,
    interface: DispatcherInterface,
}

impl WorkerConnection {
    fn new(conn: &Connection, interface: DispatcherInterface, open: bool) -> Self {
        Self {
            id: conn.id(),
            local_addr: conn.local_addr(),
            peer_addr: conn.peer_addr(),
            secure: conn.is_secure(),
            open: AtomicBool::new(open),
            read_buffer: Mutex::new(ReadBuffer::new(conn.max_read_size())),
            interface,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether TLS was active when the connection was handed to the pool.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// False once the dispatcher reported the disconnect.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.buffer().available()
    }

    pub fn read_bytes_by_delimiter(&self, delimiter: &[u8]) -> Result<Bytes, Error> {
        self.buffer().read_bytes_by_delimiter(delimiter)
    }

    pub fn read_string_by_delimiter(&self, delimiter: &str) -> Result<String, Error> {
        self.buffer().read_string_by_delimiter(delimiter)
    }

    pub fn read_bytes_by_length(&self, len: usize) -> Result<Bytes, Error> {
        self.buffer().read_bytes_by_length(len)
    }

    pub fn read_length_prefixed(&self) -> Result<Bytes, Error> {
        self.buffer().read_length_prefixed()
    }

    pub fn read_available(&self) -> Vec<Bytes> {
        self.buffer().read_available()
    }

    /// Runs several reads without another callback's reads in between. Only
    /// needed with [`Serialization::Unordered`].
    pub fn with_read_buffer<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut ReadBuffer) -> R,
    {
        f(&mut self.buffer())
    }

    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.interface.write(self.id, data)
    }

    pub fn write_str(&self, data: &str) -> Result<(), Error> {
        self.write(Bytes::copy_from_slice(data.as_bytes()))
    }

    pub fn close(&self, immediate: bool) -> Result<(), Error> {
        self.interface.close(self.id, immediate)
    }

    pub fn suspend_read(&self) -> Result<(), Error> {
        self.interface.suspend_read(self.id)
    }

    pub fn resume_read(&self) -> Result<(), Error> {
        self.interface.resume_read(self.id)
    }

    pub fn set_write_transfer_rate(&self, rate: TransferRate) -> Result<(), Error> {
        self.interface.set_write_transfer_rate(self.id, rate)
    }

    fn buffer(&self) -> MutexGuard<'_, ReadBuffer> {
        self.read_buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// [`Handler`] that runs a [`PooledHandler`] on a [`WorkerPool`].
///
/// Create one per connection, typically in the listener's factory:
///
/// ```no_run
/// # use std::sync::Arc;
/// # use streamreactor::prelude::*;
/// # struct Echo;
/// # impl PooledHandler for Echo {
/// #     fn on_data(&self, conn: &WorkerConnection) -> Result<(), Error> { Ok(()) }
/// # }
/// # fn main() -> Result<(), Error> {
/// # let config = config::Config::builder().build()?;
/// let mut dispatcher = Dispatcher::new(&config)?;
/// let pool = Arc::new(WorkerPool::new(4)?);
/// let interface = dispatcher.interface();
/// dispatcher.listen(
///     "127.0.0.1:0",
///     move || Pooled::new(Echo, pool.clone(), interface.clone()),
///     TlsMode::Plain,
/// )?;
/// # Ok(())
/// # }
/// ```
pub struct Pooled<H> {
    handler: Arc<H>,
    pool: Arc<WorkerPool>,
    queue: Arc<SerializedQueue>,
    serialization: Serialization,
    interface: DispatcherInterface,
    remote: Option<Arc<WorkerConnection>>,
}

impl<H: PooledHandler> Pooled<H> {
    pub fn new(handler: H, pool: Arc<WorkerPool>, interface: DispatcherInterface) -> Self {
        Self::shared(Arc::new(handler), pool, interface)
    }

    /// Uses one handler instance for several connections.
    pub fn shared(handler: Arc<H>, pool: Arc<WorkerPool>, interface: DispatcherInterface) -> Self {
        Self {
            handler,
            pool,
            queue: SerializedQueue::new(),
            serialization: Serialization::default(),
            interface,
            remote: None,
        }
    }

    pub fn with_serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    fn remote(&mut self, conn: &Connection) -> Arc<WorkerConnection> {
        let interface = &self.interface;
        self.remote
            .get_or_insert_with(|| {
                Arc::new(WorkerConnection::new(conn, interface.clone(), conn.is_open()))
            })
            .clone()
    }

    fn post<F>(&self, remote: Arc<WorkerConnection>, callback: &'static str, f: F)
    where
        F: FnOnce(&H, &WorkerConnection) + Send + 'static,
    {
        let id = remote.id();
        let handler = self.handler.clone();
        let job: Job = Box::new(move || {
            trace!(id, callback, "Running pooled callback");
            f(&handler, &remote);
        });
        let result = match self.serialization {
            Serialization::PerConnection => self.queue.perform(&self.pool, job),
            Serialization::Unordered => self.pool.submit(job),
        };
        if let Err(err) = result {
            warn!(id, callback, %err, "Dropping pooled callback");
        }
    }
}

// Errors of a pooled callback close the connection, like errors returned on
// the dispatcher thread do.
fn close_on_error(conn: &WorkerConnection, callback: &'static str, result: Result<(), Error>) {
    match result {
        Ok(()) => {}
        Err(err) if err.is_underflow() => trace!(id = conn.id(), "Waiting for more data"),
        Err(err) => {
            warn!(id = conn.id(), callback, %err, "Closing connection after handler error");
            if let Err(err) = conn.close(true) {
                debug!(id = conn.id(), %err, "Close request failed");
            }
        }
    }
}

fn close_unless_kept(conn: &WorkerConnection, keep: bool) {
    if keep {
        return;
    }
    if let Err(err) = conn.close(false) {
        debug!(id = conn.id(), %err, "Close request failed");
    }
}

impl<H: PooledHandler> Handler for Pooled<H> {
    fn on_connect(&mut self, conn: &mut Connection) -> Result<(), Error> {
        let remote = self.remote(conn);
        self.post(remote, "on_connect", |handler, conn| {
            close_on_error(conn, "on_connect", handler.on_connect(conn));
        });
        Ok(())
    }

    fn on_data(&mut self, conn: &mut Connection) -> Result<(), Error> {
        let data = conn.read_available();
        if data.is_empty() {
            return Ok(());
        }
        let remote = self.remote(conn);
        // Appended here so the byte order holds under any serialization.
        remote.buffer().append(data);
        self.post(remote, "on_data", |handler, conn| {
            close_on_error(conn, "on_data", handler.on_data(conn));
        });
        Ok(())
    }

    fn on_disconnect(&mut self, conn: &mut Connection) {
        let remote = self.remote(conn);
        remote.open.store(false, Ordering::Release);
        self.post(remote, "on_disconnect", |handler, conn| handler.on_disconnect(conn));
    }

    fn on_connect_exception(&mut self, conn: &mut Connection, err: &Error) {
        let remote = self.remote(conn);
        let reason = err.to_string();
        self.post(remote, "on_connect_exception", move |handler, conn| {
            handler.on_connect_exception(conn, &reason)
        });
    }

    // The decision is made on the worker; the dispatcher keeps the
    // connection until a close request comes back.
    fn on_idle_timeout(&mut self, conn: &mut Connection) -> bool {
        let remote = self.remote(conn);
        self.post(remote, "on_idle_timeout", |handler, conn| {
            close_unless_kept(conn, handler.on_idle_timeout(conn));
        });
        true
    }

    fn on_connection_timeout(&mut self, conn: &mut Connection) -> bool {
        let remote = self.remote(conn);
        self.post(remote, "on_connection_timeout", |handler, conn| {
            close_unless_kept(conn, handler.on_connection_timeout(conn));
        });
        true
    }
}
