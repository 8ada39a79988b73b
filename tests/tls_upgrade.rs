//! TLS Integration Tests
//!
//! Immediate TLS and in-band upgrades (STARTTLS) between two dispatchers.
//!
//! Use TEST_LOG=1..3 to enable tracing, see `client_server.rs`.

mod tls_test_helper;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use streamreactor::prelude::*;
use streamreactor::{EngineConfig, TlsState};
use tls_test_helper::{generate_test_tls_config, generate_test_tls_settings};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("streamreactor={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Server Side
// ============================================================================

struct SecureLineServer {
    disconnects: Arc<AtomicUsize>,
}

impl Handler for SecureLineServer {
    fn on_connect(&mut self, conn: &mut Connection) -> Result<(), Error> {
        if conn.tls_mode() == TlsMode::Immediate {
            assert!(conn.is_secure());
            conn.write_str("220 secure ready\r\n")
        } else {
            assert!(!conn.is_secure());
            conn.write_str("220 ready\r\n")
        }
    }

    fn on_data(&mut self, conn: &mut Connection) -> Result<(), Error> {
        loop {
            let line = conn.read_string_by_delimiter("\r\n")?;
            match line.as_str() {
                "STARTTLS" => {
                    assert_eq!(conn.tls_state(), Some(TlsState::Inactive));
                    conn.write_str("220 go ahead\r\n")?;
                    conn.activate_secured_mode()?;
                    assert_eq!(conn.tls_state(), Some(TlsState::Upgrading));
                }
                // The client does not wait for a reply and sends its
                // ClientHello right behind the command.
                "STARTTLS PIPELINED" => conn.activate_secured_mode()?,
                other => {
                    let reply = format!("250 {other} secure={}\r\n", conn.is_secure());
                    conn.write_str(&reply)?;
                }
            }
        }
    }

    fn on_disconnect(&mut self, _conn: &mut Connection) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct Server {
    addr: std::net::SocketAddr,
    interface: DispatcherInterface,
    disconnects: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl Server {
    fn start(mut dispatcher: Dispatcher, tls_mode: TlsMode) -> Self {
        init_tracing();
        let disconnects = Arc::new(AtomicUsize::new(0));
        let factory_disconnects = disconnects.clone();
        let (_, addr) = dispatcher
            .listen(
                "127.0.0.1:0",
                move || SecureLineServer {
                    disconnects: factory_disconnects.clone(),
                },
                tls_mode,
            )
            .expect("Failed to listen");
        let interface = dispatcher.interface();
        let handle = thread::spawn(move || dispatcher.run().expect("Dispatcher failed"));
        Self {
            addr,
            interface,
            disconnects,
            handle: Some(handle),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.interface.shutdown();
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Client Side
// ============================================================================

#[derive(Default)]
struct ClientLog {
    lines: Mutex<Vec<String>>,
    secure_on_connect: AtomicBool,
    disconnected: AtomicBool,
    failed: AtomicBool,
}

#[derive(Clone, Copy, PartialEq)]
enum Upgrade {
    None,
    WaitForReply,
    Pipelined,
}

struct UpgradeClient {
    upgrade: Upgrade,
    log: Arc<ClientLog>,
}

impl Handler for UpgradeClient {
    fn on_connect(&mut self, conn: &mut Connection) -> Result<(), Error> {
        self.log
            .secure_on_connect
            .store(conn.is_secure(), Ordering::SeqCst);
        Ok(())
    }

    fn on_data(&mut self, conn: &mut Connection) -> Result<(), Error> {
        loop {
            let line = conn.read_string_by_delimiter("\r\n")?;
            self.log.lines.lock().unwrap().push(line.clone());
            match line.as_str() {
                "220 ready" if self.upgrade == Upgrade::WaitForReply => {
                    conn.write_str("STARTTLS\r\n")?;
                }
                "220 ready" if self.upgrade == Upgrade::Pipelined => {
                    conn.write_str("STARTTLS PIPELINED\r\n")?;
                    conn.activate_secured_mode()?;
                    // Held until the handshake is done.
                    conn.write_str("HELLO\r\n")?;
                }
                "220 go ahead" => {
                    conn.activate_secured_mode()?;
                    conn.write_str("HELLO\r\n")?;
                }
                "220 secure ready" => conn.write_str("HELLO\r\n")?,
                _ if line.starts_with("250 HELLO") => conn.close(false),
                _ => {}
            }
        }
    }

    fn on_disconnect(&mut self, _conn: &mut Connection) {
        self.log.disconnected.store(true, Ordering::SeqCst);
    }

    fn on_connect_exception(&mut self, _conn: &mut Connection, _err: &Error) {
        self.log.failed.store(true, Ordering::SeqCst);
    }
}

fn run_client(
    server: &Server,
    dispatcher: &mut Dispatcher,
    tls_mode: TlsMode,
    upgrade: Upgrade,
) -> Arc<ClientLog> {
    let log = Arc::new(ClientLog::default());
    dispatcher
        .connect(
            server.addr,
            UpgradeClient {
                upgrade,
                log: log.clone(),
            },
            tls_mode,
        )
        .expect("Failed to connect");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !log.disconnected.load(Ordering::SeqCst) && Instant::now() < deadline {
        dispatcher
            .poll_once(Some(Duration::from_millis(20)))
            .unwrap();
    }
    assert!(
        log.disconnected.load(Ordering::SeqCst),
        "Client did not finish, got {:?}",
        log.lines.lock().unwrap()
    );
    assert!(!log.failed.load(Ordering::SeqCst));
    log
}

// Server and client dispatchers that trust the same certificate.
fn dispatcher_pair() -> (Dispatcher, Dispatcher) {
    let settings = generate_test_tls_settings();
    let server = Dispatcher::with_settings(EngineConfig::default(), settings.clone()).unwrap();
    let client = Dispatcher::with_settings(EngineConfig::default(), settings).unwrap();
    (server, client)
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn immediate_tls_from_config_files() {
    let (config, _guard) = generate_test_tls_config();
    let server = Server::start(Dispatcher::new(&config).unwrap(), TlsMode::Immediate);

    let mut client = Dispatcher::new(&config).unwrap();
    let log = run_client(&server, &mut client, TlsMode::Immediate, Upgrade::None);

    assert!(log.secure_on_connect.load(Ordering::SeqCst));
    assert_eq!(
        *log.lines.lock().unwrap(),
        vec!["220 secure ready", "250 HELLO secure=true"]
    );
}

#[test]
fn starttls_after_reply() {
    let (server, mut client) = dispatcher_pair();
    let server = Server::start(server, TlsMode::StartTls);
    let log = run_client(&server, &mut client, TlsMode::StartTls, Upgrade::WaitForReply);

    assert!(!log.secure_on_connect.load(Ordering::SeqCst));
    assert_eq!(
        *log.lines.lock().unwrap(),
        vec!["220 ready", "220 go ahead", "250 HELLO secure=true"]
    );
}

#[test]
fn starttls_with_pipelined_client_hello() {
    let (server, mut client) = dispatcher_pair();
    let server = Server::start(server, TlsMode::StartTls);
    let log = run_client(&server, &mut client, TlsMode::StartTls, Upgrade::Pipelined);

    assert_eq!(
        *log.lines.lock().unwrap(),
        vec!["220 ready", "250 HELLO secure=true"]
    );

    let disconnects = server.disconnects.clone();
    let deadline = Instant::now() + Duration::from_secs(5);
    while disconnects.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn plaintext_listener_cannot_upgrade() {
    struct Upgrader {
        result: Arc<Mutex<Option<bool>>>,
    }

    impl Handler for Upgrader {
        fn on_connect(&mut self, conn: &mut Connection) -> Result<(), Error> {
            let rejected = matches!(conn.activate_secured_mode(), Err(Error::TlsNotEnabled));
            *self.result.lock().unwrap() = Some(rejected);
            conn.close(true);
            Ok(())
        }

        fn on_data(&mut self, _conn: &mut Connection) -> Result<(), Error> {
            Ok(())
        }
    }

    init_tracing();
    let (mut dispatcher, _) = dispatcher_pair();
    let result = Arc::new(Mutex::new(None));
    let handler_result = result.clone();
    let (_, addr) = dispatcher
        .listen(
            "127.0.0.1:0",
            move || Upgrader {
                result: handler_result.clone(),
            },
            TlsMode::Plain,
        )
        .unwrap();

    let _stream = std::net::TcpStream::connect(addr).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while result.lock().unwrap().is_none() && Instant::now() < deadline {
        dispatcher
            .poll_once(Some(Duration::from_millis(20)))
            .unwrap();
    }
    assert_eq!(*result.lock().unwrap(), Some(true));
}

#[test]
fn tls_state_names() {
    assert_eq!(TlsState::Inactive.as_str(), "inactive");
    assert_eq!(TlsState::Active.as_str(), "active");
}
