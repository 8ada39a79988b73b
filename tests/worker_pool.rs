//! Worker Pool Integration Tests
//!
//! Handlers wrapped in `Pooled` run on worker threads while the dispatcher
//! keeps doing the socket I/O.
//!
//! # Running with tracing
//!
//! ```bash
//! TEST_LOG=2 cargo test --test worker_pool -- --nocapture
//! ```

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use streamreactor::prelude::*;

static INIT: Once = Once::new();

/// Initialize tracing based on TEST_LOG environment variable
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
// Helper Functions
// ============================================================================

struct PooledServer {
    addr: SocketAddr,
    interface: DispatcherInterface,
    handle: Option<JoinHandle<()>>,
}

impl PooledServer {
    fn start<H, F>(pool: Arc<WorkerPool>, serialization: Serialization, mut handler: F) -> Self
    where
        H: PooledHandler,
        F: FnMut() -> H + Send + 'static,
    {
        init_tracing();
        let config = config::Config::builder().build().unwrap();
        let mut dispatcher = Dispatcher::new(&config).expect("Failed to create dispatcher");
        let interface = dispatcher.interface();
        let factory_interface = interface.clone();
        let (_, addr) = dispatcher
            .listen(
                "127.0.0.1:0",
                move || {
                    Pooled::new(handler(), pool.clone(), factory_interface.clone())
                        .with_serialization(serialization)
                },
                TlsMode::Plain,
            )
            .expect("Failed to listen");
        let handle = thread::spawn(move || dispatcher.run().expect("Dispatcher failed"));

        Self {
            addr,
            interface,
            handle: Some(handle),
        }
    }
}

impl Drop for PooledServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.interface.shutdown();
            let _ = handle.join();
        }
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("Failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ============================================================================
// Line Echo on Workers
// ============================================================================

#[derive(Default)]
struct Journal {
    events: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
    threads: Mutex<Vec<String>>,
}

struct WorkerEcho {
    journal: Arc<Journal>,
}

impl WorkerEcho {
    fn enter(&self, event: &str) {
        if self.journal.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.journal.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.journal.events.lock().unwrap().push(event.to_string());
        let name = thread::current().name().unwrap_or("").to_string();
        self.journal.threads.lock().unwrap().push(name);
        // Widens the window for a second callback to sneak in.
        thread::sleep(Duration::from_millis(2));
    }

    fn leave(&self) {
        self.journal.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn echo_lines(conn: &WorkerConnection) -> Result<(), Error> {
    loop {
        let line = conn.read_string_by_delimiter("\r\n")?;
        if line == "QUIT" {
            conn.write_str("221 bye\r\n")?;
            return conn.close(false);
        }
        conn.write_str(&format!("250 {line}\r\n"))?;
    }
}

impl PooledHandler for WorkerEcho {
    fn on_connect(&self, conn: &WorkerConnection) -> Result<(), Error> {
        self.enter("connect");
        let result = conn.write_str("220 ready\r\n");
        self.leave();
        result
    }

    fn on_data(&self, conn: &WorkerConnection) -> Result<(), Error> {
        self.enter("data");
        let result = echo_lines(conn);
        self.leave();
        result
    }

    fn on_disconnect(&self, conn: &WorkerConnection) {
        self.enter(if conn.is_open() { "disconnect while open" } else { "disconnect" });
        self.leave();
    }
}

#[test]
fn pooled_callbacks_are_serialized_per_connection() {
    let pool = Arc::new(WorkerPool::new(4).unwrap());
    let journal = Arc::new(Journal::default());
    let factory_journal = journal.clone();
    let server = PooledServer::start(pool, Serialization::PerConnection, move || WorkerEcho {
        journal: factory_journal.clone(),
    });

    let stream = connect(server.addr);
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "220 ready\r\n");

    // Separate segments, so the dispatcher posts many on_data callbacks
    // while earlier ones are still running.
    for n in 0..40 {
        writer.write_all(format!("LINE {n}\r\n").as_bytes()).unwrap();
        writer.flush().unwrap();
        if n % 4 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    for n in 0..40 {
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, format!("250 LINE {n}\r\n"));
    }

    writer.write_all(b"QUIT\r\n").unwrap();
    line.clear();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "221 bye\r\n");
    let mut rest = Vec::new();
    let _ = reader.read_to_end(&mut rest);

    assert!(wait_until(Duration::from_secs(5), || {
        journal.events.lock().unwrap().last().map(String::as_str) == Some("disconnect")
    }));
    assert_eq!(journal.overlaps.load(Ordering::SeqCst), 0);

    let events = journal.events.lock().unwrap().clone();
    assert_eq!(events.first().map(String::as_str), Some("connect"));
    assert_eq!(events.iter().filter(|e| *e == "disconnect").count(), 1);
    assert!(journal
        .threads
        .lock()
        .unwrap()
        .iter()
        .all(|name| name.starts_with("streamreactor-worker-")));
}

// ============================================================================
// Serialization Opt-Out
// ============================================================================

#[derive(Default)]
struct Concurrency {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

/// Holds every on_data call until a second one runs or the wait ends.
struct Overlapping {
    stats: Arc<Concurrency>,
}

impl PooledHandler for Overlapping {
    fn on_data(&self, conn: &WorkerConnection) -> Result<(), Error> {
        conn.read_available();
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);
        wait_until(Duration::from_millis(500), || {
            self.stats.peak.load(Ordering::SeqCst) >= 2
        });
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn peak_in_flight(serialization: Serialization) -> usize {
    let pool = Arc::new(WorkerPool::new(4).unwrap());
    let stats = Arc::new(Concurrency::default());
    let factory_stats = stats.clone();
    let server = PooledServer::start(pool, serialization, move || Overlapping {
        stats: factory_stats.clone(),
    });

    let mut stream = connect(server.addr);
    stream.write_all(b"first").unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"second").unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        stats.calls.load(Ordering::SeqCst) == 2
    }));
    stats.peak.load(Ordering::SeqCst)
}

#[test]
fn serialized_callbacks_never_overlap() {
    assert_eq!(peak_in_flight(Serialization::PerConnection), 1);
}

#[test]
fn unordered_callbacks_may_overlap() {
    assert_eq!(peak_in_flight(Serialization::Unordered), 2);
}

// ============================================================================
// Timeouts on Workers
// ============================================================================

struct KeepOnce {
    idle_calls: Arc<AtomicUsize>,
}

impl PooledHandler for KeepOnce {
    fn on_data(&self, conn: &WorkerConnection) -> Result<(), Error> {
        conn.read_available();
        Ok(())
    }

    // Keeps the connection through the first idle timeout only.
    fn on_idle_timeout(&self, _conn: &WorkerConnection) -> bool {
        self.idle_calls.fetch_add(1, Ordering::SeqCst) == 0
    }
}

#[test]
fn idle_timeout_is_decided_on_the_worker() {
    init_tracing();
    let config = config::Config::builder()
        .set_default("idle_timeout_ms", 150)
        .unwrap()
        .set_default("timeout_check_period_ms", 50)
        .unwrap()
        .build()
        .unwrap();
    let pool = Arc::new(WorkerPool::from_config(&config, "").unwrap());
    let idle_calls = Arc::new(AtomicUsize::new(0));

    let mut dispatcher = Dispatcher::new(&config).unwrap();
    let interface = dispatcher.interface();
    let factory_calls = idle_calls.clone();
    let factory_interface = interface.clone();
    let (_, addr) = dispatcher
        .listen(
            "127.0.0.1:0",
            move || {
                Pooled::new(
                    KeepOnce {
                        idle_calls: factory_calls.clone(),
                    },
                    pool.clone(),
                    factory_interface.clone(),
                )
            },
            TlsMode::Plain,
        )
        .unwrap();
    let handle = thread::spawn(move || dispatcher.run().unwrap());

    let started = Instant::now();
    let mut stream = connect(addr);
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    // Kept once, closed on the second timeout.
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(wait_until(Duration::from_secs(5), || {
        idle_calls.load(Ordering::SeqCst) == 2
    }));

    interface.shutdown().unwrap();
    handle.join().unwrap();
}
