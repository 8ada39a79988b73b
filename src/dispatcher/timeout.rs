use super::interface::Request;
use crate::error::Error;
use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Background thread that asks the dispatcher for a timeout sweep once per
/// period. Stopped and joined on drop.
pub(crate) struct TimeoutTimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutTimer {
    pub(crate) fn spawn(
        period: Duration,
        sender: Sender<Request>,
        waker: Arc<Waker>,
    ) -> Result<Self, Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("streamreactor-timeout".to_string())
            .spawn(move || {
                debug!(?period, "Timeout timer started");
                loop {
                    let deadline = Instant::now() + period;
                    // park_timeout may return early; wait out the whole period.
                    loop {
                        if thread_stop.load(Ordering::Acquire) {
                            return;
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        thread::park_timeout(deadline - now);
                    }
                    trace!("Requesting timeout sweep");
                    if sender.send(Request::CheckTimeouts).is_err() || waker.wake().is_err() {
                        debug!("Dispatcher gone, stopping timeout timer");
                        return;
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}
