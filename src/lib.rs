//! streamreactor - A non-blocking TCP connection engine for Rust
//!
//! streamreactor runs many TCP connections on one thread with mio. Received
//! bytes land in pooled buffers and are framed by delimiter or by length
//! without copying; writes are queued, merged and sent when the socket is
//! writable. Connections can start out in plaintext and switch to TLS in the
//! middle of the stream (STARTTLS), or use TLS from the first byte.
//!
//! Applications implement [`Handler`] and register it with a [`Dispatcher`],
//! either per outbound connection or through a [`HandlerFactory`] per
//! listener. Other threads drive the dispatcher through a
//! [`DispatcherInterface`]. Callbacks run on the dispatcher thread unless the
//! handler is wrapped in a [`Pooled`] adapter, which runs them on a
//! [`WorkerPool`].
//!
//! See the README for a quick start guide and the configuration keys.

// Internal-only modules
pub(crate) mod chain;
pub(crate) mod dispatcher;
pub(crate) mod error;
pub(crate) mod handler;
pub(crate) mod socket;

// Building blocks that are useful on their own
pub mod buffer;
pub mod config;
pub mod framing;
pub mod memory;
pub mod tls;
pub mod worker;

mod connection;

// These are the intended public API
pub use crate::config::EngineConfig;
pub use connection::{Connection, TransferRate};
pub use dispatcher::{Dispatcher, DispatcherInterface, DispatcherStats};
pub use error::Error;
pub use handler::{Handler, HandlerFactory};
pub use socket::{SocketOption, SocketOptionName, SocketState};
pub use tls::{TlsMode, TlsSettings, TlsState};
pub use worker::{Pooled, PooledHandler, Serialization, WorkerConnection, WorkerPool};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::connection::{Connection, TransferRate};
    pub use crate::dispatcher::{Dispatcher, DispatcherInterface};
    pub use crate::error::Error;
    pub use crate::handler::{Handler, HandlerFactory};
    pub use crate::tls::{TlsMode, TlsSettings};
    pub use crate::worker::{Pooled, PooledHandler, Serialization, WorkerConnection, WorkerPool};
}
