use crate::error::Error;
use mio::net::TcpStream;
use socket2::SockRef;
use std::time::Duration;

/// Socket option names understood by [`Connection::option`](crate::Connection::option).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOptionName {
    ReceiveBufferSize,
    SendBufferSize,
    ReuseAddress,
    KeepAlive,
    NoDelay,
    Linger,
}

/// A socket option together with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// `SO_RCVBUF` in bytes.
    ReceiveBufferSize(usize),
    /// `SO_SNDBUF` in bytes.
    SendBufferSize(usize),
    /// `SO_REUSEADDR`.
    ReuseAddress(bool),
    /// `SO_KEEPALIVE`.
    KeepAlive(bool),
    /// `TCP_NODELAY`.
    NoDelay(bool),
    /// `SO_LINGER`; `None` disables lingering.
    Linger(Option<Duration>),
}

impl SocketOption {
    pub fn name(&self) -> SocketOptionName {
        match self {
            SocketOption::ReceiveBufferSize(_) => SocketOptionName::ReceiveBufferSize,
            SocketOption::SendBufferSize(_) => SocketOptionName::SendBufferSize,
            SocketOption::ReuseAddress(_) => SocketOptionName::ReuseAddress,
            SocketOption::KeepAlive(_) => SocketOptionName::KeepAlive,
            SocketOption::NoDelay(_) => SocketOptionName::NoDelay,
            SocketOption::Linger(_) => SocketOptionName::Linger,
        }
    }
}

pub(crate) fn set_option(stream: &TcpStream, option: SocketOption) -> Result<(), Error> {
    let socket = SockRef::from(stream);
    match option {
        SocketOption::ReceiveBufferSize(size) => socket.set_recv_buffer_size(size)?,
        SocketOption::SendBufferSize(size) => socket.set_send_buffer_size(size)?,
        SocketOption::ReuseAddress(on) => socket.set_reuse_address(on)?,
        SocketOption::KeepAlive(on) => socket.set_keepalive(on)?,
        SocketOption::NoDelay(on) => socket.set_nodelay(on)?,
        SocketOption::Linger(linger) => socket.set_linger(linger)?,
    }
    Ok(())
}

pub(crate) fn option(stream: &TcpStream, name: SocketOptionName) -> Result<SocketOption, Error> {
    let socket = SockRef::from(stream);
    let option = match name {
        SocketOptionName::ReceiveBufferSize => {
            SocketOption::ReceiveBufferSize(socket.recv_buffer_size()?)
        }
        SocketOptionName::SendBufferSize => SocketOption::SendBufferSize(socket.send_buffer_size()?),
        SocketOptionName::ReuseAddress => SocketOption::ReuseAddress(socket.reuse_address()?),
        SocketOptionName::KeepAlive => SocketOption::KeepAlive(socket.keepalive()?),
        SocketOptionName::NoDelay => SocketOption::NoDelay(socket.nodelay()?),
        SocketOptionName::Linger => SocketOption::Linger(socket.linger()?),
    };
    Ok(option)
}
