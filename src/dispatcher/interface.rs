use crate::connection::TransferRate;
use crate::error::Error;
use crate::handler::{Handler, HandlerFactory};
use crate::tls::TlsMode;
use bytes::Bytes;
use mio::Waker;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{
    mpsc::{channel, Sender},
    Arc,
};

// Internal request type for cross-thread communication
pub(crate) enum Request {
    // Connection Management
    Connect {
        addr: SocketAddr,
        tls_mode: TlsMode,
        handler: Box<dyn Handler>,
        response: Sender<Result<usize, Error>>,
    },
    Listen {
        addr: SocketAddr,
        tls_mode: TlsMode,
        factory: Box<dyn HandlerFactory>,
        response: Sender<Result<(usize, SocketAddr), Error>>,
    },
    Close {
        id: usize,
        immediate: bool,
    },
    CloseListener {
        id: usize,
    },
    Shutdown,

    // Data Operations
    Write {
        id: usize,
        data: Bytes,
    },
    SuspendRead {
        id: usize,
    },
    ResumeRead {
        id: usize,
    },
    SetWriteTransferRate {
        id: usize,
        rate: TransferRate,
    },

    // Timer
    CheckTimeouts,
}

/// Thread-safe handle for driving a [`Dispatcher`](super::Dispatcher) from
/// other threads.
///
/// Obtain one with [`Dispatcher::interface()`](super::Dispatcher::interface).
/// Every request is queued and the dispatcher is woken up; the dispatcher
/// runs it on its own thread, so connection callbacks never race with it.
///
/// The blocking calls ([`connect`](Self::connect), [`listen`](Self::listen))
/// must not be made from the dispatcher thread itself.
#[derive(Debug, Clone)]
pub struct DispatcherInterface {
    pub(crate) sender: Sender<Request>,
    pub(crate) waker: Arc<Waker>,
}

impl DispatcherInterface {
    // ============================================================================
    // Connection Management
    // ============================================================================

    /// Opens an outbound connection handled by `handler` and returns its id.
    ///
    /// Blocks until the dispatcher has started the connect. The outcome is
    /// reported to the handler through `on_connect` or `on_connect_exception`.
    pub fn connect<A, H>(&self, addr: A, handler: H, tls_mode: TlsMode) -> Result<usize, Error>
    where
        A: ToSocketAddrs,
        H: Handler + 'static,
    {
        let addr = resolve(addr)?;
        let (tx, rx) = channel();
        self.send(Request::Connect {
            addr,
            tls_mode,
            handler: Box::new(handler),
            response: tx,
        })?;
        rx.recv().map_err(|_| Error::DispatcherClosed)?
    }

    /// Starts listening on `addr`. Returns the listener id and bound address.
    pub fn listen<A, F>(
        &self,
        addr: A,
        factory: F,
        tls_mode: TlsMode,
    ) -> Result<(usize, SocketAddr), Error>
    where
        A: ToSocketAddrs,
        F: HandlerFactory + 'static,
    {
        let addr = resolve(addr)?;
        let (tx, rx) = channel();
        self.send(Request::Listen {
            addr,
            tls_mode,
            factory: Box::new(factory),
            response: tx,
        })?;
        rx.recv().map_err(|_| Error::DispatcherClosed)?
    }

    /// Queues a close of connection `id`.
    pub fn close(&self, id: usize, immediate: bool) -> Result<(), Error> {
        self.send(Request::Close { id, immediate })
    }

    pub fn close_listener(&self, id: usize) -> Result<(), Error> {
        self.send(Request::CloseListener { id })
    }

    /// Asks the dispatcher to close everything and return from
    /// [`run()`](super::Dispatcher::run).
    pub fn shutdown(&self) -> Result<(), Error> {
        self.send(Request::Shutdown)
    }

    // ============================================================================
    // Data Operations
    // ============================================================================

    /// Queues `data` to be written to connection `id`.
    pub fn write(&self, id: usize, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send(Request::Write {
            id,
            data: data.into(),
        })
    }

    pub fn suspend_read(&self, id: usize) -> Result<(), Error> {
        self.send(Request::SuspendRead { id })
    }

    pub fn resume_read(&self, id: usize) -> Result<(), Error> {
        self.send(Request::ResumeRead { id })
    }

    pub fn set_write_transfer_rate(&self, id: usize, rate: TransferRate) -> Result<(), Error> {
        self.send(Request::SetWriteTransferRate { id, rate })
    }

    pub(crate) fn send(&self, request: Request) -> Result<(), Error> {
        self.sender
            .send(request)
            .map_err(|_| Error::DispatcherClosed)?;
        self.waker.wake()?;
        Ok(())
    }
}

pub(crate) fn resolve<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr, Error> {
    addr.to_socket_addrs()?
        .next()
        .ok_or(Error::InvalidAddress)
}
