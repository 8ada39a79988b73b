//! Running handler callbacks on a pool of worker threads.
//!
//! By default every callback runs on the dispatcher thread. Wrapping a
//! [`PooledHandler`] in a [`Pooled`] adapter moves the callbacks of that
//! connection onto a [`WorkerPool`] instead. The dispatcher thread keeps
//! doing all socket I/O; received bytes are handed over to the connection's
//! [`WorkerConnection`], and writes, closes and read suspension travel back
//! through the [`DispatcherInterface`](crate::DispatcherInterface).
//!
//! Callbacks of one connection run one at a time and in order
//! ([`Serialization::PerConnection`]). [`Serialization::Unordered`] gives that
//! up and lets callbacks of the same connection run concurrently.

mod pooled;
mod queue;

pub use pooled::{Pooled, PooledHandler, Serialization, WorkerConnection};

use crate::config::{get_namespaced_usize, optional};
use crate::error::Error;
use crate::handler::panic_message;
use ::config::Config;
use crossbeam_channel::{unbounded, Sender};
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

pub(crate) use queue::SerializedQueue;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

const DEFAULT_WORKER_THREADS: usize = 4;

/// Fixed set of threads running queued jobs.
///
/// Dropping the pool lets the queued jobs finish and joins the threads.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, Error> {
        if threads == 0 {
            return Err(Error::InvalidConfig {
                key: "worker_threads".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for worker in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("streamreactor-worker-{worker}"))
                .spawn(move || {
                    debug!(worker, "Worker started");
                    for job in receiver.iter() {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                            error!(worker, message = %panic_message(payload), "Job panicked");
                        }
                    }
                    debug!(worker, "Worker stopped");
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Reads `worker_threads` (looked up as `name.worker_threads`, then
    /// `worker_threads`). Defaults to the available parallelism.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let threads = match optional(get_namespaced_usize(config, name, "worker_threads"))? {
            Some(threads) => threads,
            None => thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(DEFAULT_WORKER_THREADS),
        };
        Self::new(threads)
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queues `job` for the next free worker.
    pub fn execute<F>(&self, job: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(job))
    }

    pub(crate) fn submit(&self, job: Job) -> Result<(), Error> {
        let sender = self.sender.as_ref().ok_or(Error::WorkerPoolClosed)?;
        sender.send(job).map_err(|_| Error::WorkerPoolClosed)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers leave their loop once the channel is closed and drained.
        self.sender.take();
        // A worker dropping the last handle cannot join itself.
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn jobs_run_on_worker_threads() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);

        let (tx, rx) = channel();
        for n in 0..10 {
            let tx = tx.clone();
            pool.execute(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send((n, name)).unwrap();
            })
            .unwrap();
        }

        let mut seen: Vec<usize> = Vec::new();
        for _ in 0..10 {
            let (n, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(name.unwrap().starts_with("streamreactor-worker-"));
            seen.push(n);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn a_panicking_job_does_not_kill_its_worker() {
        let pool = WorkerPool::new(1).unwrap();
        pool.execute(|| panic!("job failed")).unwrap();

        let (tx, rx) = channel();
        pool.execute(move || tx.send(()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn drop_finishes_queued_jobs() {
        let (tx, rx) = channel();
        {
            let pool = WorkerPool::new(1).unwrap();
            for n in 0..5 {
                let tx = tx.clone();
                pool.execute(move || {
                    thread::sleep(Duration::from_millis(5));
                    tx.send(n).unwrap();
                })
                .unwrap();
            }
        }
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }
}
