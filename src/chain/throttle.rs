use super::{IoStage, StageContext, WrittenTracker};
use crate::buffer::BufferChain;
use crate::error::Error;
use bytes::Bytes;
use std::any::Any;
use std::time::{Duration, Instant};
use tracing::trace;

/// Interval between two releases of throttled data.
pub(crate) const THROTTLE_TICK: Duration = Duration::from_millis(100);

/// Outbound pacing stage.
///
/// Holds written data and releases `rate × elapsed` bytes on every tick. The
/// dispatcher bounds its poll timeout by [`next_deadline`](IoStage::next_deadline),
/// so pacing never sleeps on the reactor thread.
pub(crate) struct ThrottleStage {
    bytes_per_sec: u64,
    queue: BufferChain,
    last_release: Instant,
    // Fractional bytes carried between ticks.
    credit: f64,
    tracker: WrittenTracker,
}

impl ThrottleStage {
    pub(crate) fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            queue: BufferChain::new(),
            last_release: Instant::now(),
            credit: 0.0,
            tracker: WrittenTracker::default(),
        }
    }

    pub(crate) fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    pub(crate) fn set_rate(&mut self, bytes_per_sec: u64) {
        self.bytes_per_sec = bytes_per_sec.max(1);
    }
}

impl IoStage for ThrottleStage {
    fn name(&self) -> &'static str {
        "throttle"
    }

    fn on_inbound(&mut self, data: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error> {
        for buffer in data {
            ctx.deliver(buffer);
        }
        Ok(())
    }

    fn on_outbound(&mut self, data: Vec<Bytes>, _ctx: &mut StageContext) -> Result<(), Error> {
        if self.queue.is_empty() {
            // Pacing restarts with the first byte queued after an idle period.
            self.last_release = Instant::now();
            self.credit = 0.0;
        }
        for buffer in data {
            self.tracker.record(Some(buffer.clone()), buffer.len());
            self.queue.append(buffer);
        }
        Ok(())
    }

    fn on_written(&mut self, written: Vec<Bytes>) -> Vec<Bytes> {
        self.tracker.map(written)
    }

    fn on_tick(&mut self, now: Instant, ctx: &mut StageContext) -> Result<(), Error> {
        if self.queue.is_empty() || now < self.last_release + THROTTLE_TICK {
            return Ok(());
        }

        let elapsed = now.duration_since(self.last_release).as_secs_f64();
        let allowance = self.credit + self.bytes_per_sec as f64 * elapsed;
        let release = (allowance.floor() as usize).min(self.queue.size());
        self.credit = allowance - release as f64;
        self.last_release = now;

        if release > 0 {
            for buffer in self.queue.split_to(release) {
                ctx.send(buffer);
            }
            trace!(
                released = release,
                remaining = self.queue.size(),
                rate = self.bytes_per_sec,
                "Released throttled data"
            );
        }
        if self.queue.is_empty() {
            self.credit = 0.0;
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        (!self.queue.is_empty()).then(|| self.last_release + THROTTLE_TICK)
    }

    fn on_close(&mut self, immediate: bool, ctx: &mut StageContext) -> Result<(), Error> {
        let held = self.queue.drain();
        if immediate {
            self.tracker.clear();
        } else {
            for buffer in held {
                ctx.send(buffer);
            }
        }
        Ok(())
    }

    fn pending_size(&self) -> usize {
        self.queue.size()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
