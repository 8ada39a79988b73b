//! Application callbacks.
//!
//! A [`Handler`] is owned by the dispatcher together with its connection and
//! is only ever called from the dispatcher thread, one callback at a time.
//! Every callback receives the [`Connection`] it belongs to; reads, writes and
//! control requests made through it take effect once the callback returns.
//!
//! Only [`on_data`](Handler::on_data) is required. The other callbacks have
//! defaults that do what the engine would do without a handler: nothing, or
//! close on timeout.

use crate::connection::Connection;
use crate::error::Error;
use bytes::Bytes;
use std::any::Any;
use std::io;

pub trait Handler: Send {
    /// The connection is established. For connections using
    /// [`TlsMode::Immediate`](crate::TlsMode::Immediate) this is after the
    /// TLS handshake.
    fn on_connect(&mut self, _conn: &mut Connection) -> Result<(), Error> {
        Ok(())
    }

    /// New bytes were appended to the read buffer.
    ///
    /// Return [`Error::BufferUnderflow`] (usually through `?` on a read) to
    /// wait for more data. Any other error closes the connection. The peer
    /// may already have closed when this runs; [`Connection::is_open`] tells,
    /// and writes then fail with [`Error::PeerClosed`].
    fn on_data(&mut self, conn: &mut Connection) -> Result<(), Error>;

    /// The connection is gone. Called exactly once for every connection that
    /// got `on_connect`.
    fn on_disconnect(&mut self, _conn: &mut Connection) {}

    /// An outbound connect failed. No other callback follows.
    fn on_connect_exception(&mut self, _conn: &mut Connection, _err: &Error) {}

    /// Nothing was received for the configured idle timeout. Return `true`
    /// to keep the connection open; the idle clock restarts.
    fn on_idle_timeout(&mut self, _conn: &mut Connection) -> bool {
        false
    }

    /// The connection outlived the configured connection timeout. Return
    /// `true` to keep it open; the connection timeout is then disabled for it.
    fn on_connection_timeout(&mut self, _conn: &mut Connection) -> bool {
        false
    }

    /// A buffer passed to one of the write methods went out to the socket.
    fn on_written(&mut self, _conn: &mut Connection, _data: &Bytes) {}

    /// Writing `data` failed. The connection is closed afterwards.
    fn on_write_exception(&mut self, _conn: &mut Connection, _err: &io::Error, _data: &Bytes) {}
}

/// Creates one handler per accepted connection.
pub trait HandlerFactory: Send {
    fn create(&mut self) -> Box<dyn Handler>;
}

impl<F, H> HandlerFactory for F
where
    F: FnMut() -> H + Send,
    H: Handler + 'static,
{
    fn create(&mut self) -> Box<dyn Handler> {
        Box::new(self())
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
