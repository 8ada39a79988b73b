use super::{Job, WorkerPool};
use crate::error::Error;
use crate::handler::panic_message;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, trace};

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    running: bool,
}

/// Jobs of one connection. At most one of them runs at any time, in the order
/// they were queued, on whatever worker picks the queue up.
#[derive(Default)]
pub(crate) struct SerializedQueue {
    state: Mutex<QueueState>,
}

impl SerializedQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues `job`. A worker is only requested when none is draining the
    /// queue already.
    pub(crate) fn perform(self: &Arc<Self>, pool: &WorkerPool, job: Job) -> Result<(), Error> {
        let start = {
            let mut state = self.lock();
            state.jobs.push_back(job);
            !std::mem::replace(&mut state.running, true)
        };
        if !start {
            return Ok(());
        }

        let queue = self.clone();
        if let Err(err) = pool.submit(Box::new(move || queue.run_pending())) {
            let mut state = self.lock();
            state.jobs.clear();
            state.running = false;
            return Err(err);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    fn run_pending(&self) {
        let mut ran = 0usize;
        loop {
            let job = {
                let mut state = self.lock();
                match state.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        state.running = false;
                        trace!(ran, "Queue drained");
                        return;
                    }
                }
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                error!(message = %panic_message(payload), "Queued job panicked");
            }
            ran += 1;
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn jobs_run_one_at_a_time_in_order() {
        let pool = WorkerPool::new(4).unwrap();
        let queue = SerializedQueue::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel();

        for n in 0..50 {
            let in_flight = in_flight.clone();
            let overlaps = overlaps.clone();
            let order = order.clone();
            let tx = tx.clone();
            let job: Job = Box::new(move || {
                if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(1));
                order.lock().unwrap().push(n);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
            queue.perform(&pool, job).unwrap();
        }

        for _ in 0..50 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn a_panicking_job_does_not_stall_the_queue() {
        let pool = WorkerPool::new(1).unwrap();
        let queue = SerializedQueue::new();
        let (tx, rx) = channel();

        queue.perform(&pool, Box::new(|| panic!("job failed"))).unwrap();
        queue
            .perform(&pool, Box::new(move || tx.send("after").unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "after");
    }

    #[test]
    fn queue_restarts_after_draining() {
        let pool = WorkerPool::new(2).unwrap();
        let queue = SerializedQueue::new();
        let (tx, rx) = channel();

        let first = tx.clone();
        queue
            .perform(&pool, Box::new(move || first.send(1).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        // Let the drain loop see the empty queue.
        thread::sleep(Duration::from_millis(20));

        queue
            .perform(&pool, Box::new(move || tx.send(2).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }
}
