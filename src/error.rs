use thiserror::Error;

/// The error type for streamreactor operations.
///
/// Framing conditions (`BufferUnderflow`) are resumable and are expected to be
/// returned from [`Handler::on_data`](crate::Handler::on_data) with `?` until
/// enough bytes have arrived. Every other error escaping a handler callback
/// closes that one connection; the dispatcher itself keeps running.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Attempted to operate on a connection ID that doesn't exist.
    #[error("Connection {id} not found")]
    ConnectionNotFound {
        /// The connection ID that was not found.
        id: usize,
    },

    /// Attempted to operate on a listener ID that doesn't exist.
    #[error("Listener {id} not found")]
    ListenerNotFound {
        /// The listener ID that was not found.
        id: usize,
    },

    /// The peer closed its side of the connection (end of stream). Returned
    /// by writes made after end of stream was read, typically from the last
    /// `on_data` of a connection.
    #[error("Connection closed by peer")]
    PeerClosed,

    /// Attempted to write to or reconfigure a connection that is closed or
    /// closing.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The dispatcher event loop is gone, so a cross-thread request could not
    /// be delivered or answered.
    #[error("Dispatcher terminated")]
    DispatcherClosed,

    /// The worker pool was shut down, so a callback could not be scheduled.
    #[error("Worker pool shut down")]
    WorkerPoolClosed,

    /// The dispatcher already holds the configured maximum of connections.
    #[error("Maximum of {max} connections reached")]
    MaxConnectionsReached {
        /// The configured maximum.
        max: usize,
    },

    // ============================================================================
    // Framing Errors
    // ============================================================================

    /// Not enough data has been received yet. Retry after the next `on_data`.
    #[error("Buffer underflow: not enough data available")]
    BufferUnderflow,

    /// A record grew beyond the allowed maximum before its delimiter was found,
    /// or a length prefix declared more than the maximum.
    #[error("Max read size of {max} bytes exceeded")]
    MaxReadSizeExceeded {
        /// The configured maximum.
        max: usize,
    },

    /// A length-prefixed write needs the write mark, but one is already set.
    #[error("A write mark is already set")]
    WriteMarkActive,

    /// Record data doesn't match the expected format.
    #[error("Malformed data: {0}")]
    MalformedData(String),

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// The TLS engine reported a fatal condition (handshake failure, bad
    /// record, alert from the peer).
    #[error("TLS failure: {0}")]
    TlsHandshake(String),

    /// Attempted to accept TLS connections but server configuration is missing.
    ///
    /// Provide `tls_server_cert` and `tls_server_key` configuration keys.
    #[error("TLS server configuration not provided")]
    TlsServerConfigMissing,

    /// Attempted to open a TLS client connection but client configuration is
    /// missing.
    #[error("TLS client configuration not provided")]
    TlsClientConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    /// `activate_secured_mode()` was called on a connection that was opened
    /// without a TLS stage.
    #[error("Connection has no TLS stage")]
    TlsNotEnabled,

    /// A TLS state transition was requested from the wrong state.
    #[error("Cannot {operation} in TLS state {state}")]
    TlsInvalidState {
        operation: &'static str,
        state: &'static str,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// A configuration value is out of range.
    #[error("Invalid value for '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },

    // ============================================================================
    // Handler Errors
    // ============================================================================

    /// An application callback panicked. The connection was closed.
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),
}

impl Error {
    /// Returns true for conditions that only mean "not enough data yet".
    pub fn is_underflow(&self) -> bool {
        matches!(self, Error::BufferUnderflow)
    }
}
