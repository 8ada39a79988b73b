//! Per-connection stage stack between the socket and the application.
//!
//! Stages sit in an ordered stack, index 0 nearest the socket. Inbound data
//! enters at the bottom and leaves at the top into the connection's read
//! buffer; outbound data enters at the top and leaves at the bottom into the
//! socket's write queue. A stage may produce data in either direction while it
//! handles data or a timer tick (a TLS stage answers a handshake message with
//! one of its own), and [`IoChain`] routes that output through the remaining
//! stages. Inserting a stage is a splice into the stack; its neighbours are not
//! touched.

pub(crate) mod throttle;

use crate::error::Error;
use bytes::Bytes;
use std::any::Any;
use std::collections::VecDeque;
use std::time::Instant;

/// Notifications a stage raises for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageEvent {
    HandshakeFinished,
}

/// Output collected while a stage handles one call.
#[derive(Debug, Default)]
pub(crate) struct StageContext {
    inbound: Vec<Bytes>,
    outbound: Vec<Bytes>,
    close: Option<bool>,
    events: Vec<StageEvent>,
}

impl StageContext {
    /// Passes data on toward the application.
    pub(crate) fn deliver(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.inbound.push(data);
        }
    }

    /// Passes data on toward the socket.
    pub(crate) fn send(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.outbound.push(data);
        }
    }

    /// Asks for the connection to be closed. An immediate request wins over a
    /// graceful one.
    pub(crate) fn request_close(&mut self, immediate: bool) {
        self.close = Some(self.close.unwrap_or(false) || immediate);
    }

    pub(crate) fn emit(&mut self, event: StageEvent) {
        self.events.push(event);
    }

    #[cfg(test)]
    pub(crate) fn take_inbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.inbound)
    }

    #[cfg(test)]
    pub(crate) fn take_outbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbound)
    }

    #[cfg(test)]
    pub(crate) fn take_events(&mut self) -> Vec<StageEvent> {
        std::mem::take(&mut self.events)
    }

    #[cfg(test)]
    pub(crate) fn close_requested(&self) -> Option<bool> {
        self.close
    }
}

/// One stage of the stack.
pub(crate) trait IoStage: Send {
    fn name(&self) -> &'static str;

    /// Handles data coming from the socket side.
    fn on_inbound(&mut self, data: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error>;

    /// Handles data coming from the application side.
    fn on_outbound(&mut self, data: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error>;

    /// Maps buffers reported written by the stage below to the buffers this
    /// stage received from above.
    fn on_written(&mut self, written: Vec<Bytes>) -> Vec<Bytes> {
        written
    }

    fn on_tick(&mut self, _now: Instant, _ctx: &mut StageContext) -> Result<(), Error> {
        Ok(())
    }

    /// When the stage next wants [`on_tick`](Self::on_tick).
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    /// Called top to bottom when the connection closes. A graceful close
    /// should release everything still held.
    fn on_close(&mut self, _immediate: bool, _ctx: &mut StageContext) -> Result<(), Error> {
        Ok(())
    }

    /// Outbound bytes held by the stage.
    fn pending_size(&self) -> usize {
        0
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Everything that left the stack during one operation.
#[derive(Debug, Default)]
pub(crate) struct ChainOutput {
    pub(crate) inbound: Vec<Bytes>,
    pub(crate) outbound: Vec<Bytes>,
    pub(crate) close: Option<bool>,
    pub(crate) events: Vec<StageEvent>,
}

impl ChainOutput {
    fn absorb_signals(&mut self, ctx: &mut StageContext) {
        if let Some(immediate) = ctx.close.take() {
            self.close = Some(self.close.unwrap_or(false) || immediate);
        }
        self.events.append(&mut ctx.events);
    }
}

/// Ordered stack of stages. An empty stack passes data straight through.
#[derive(Default)]
pub(crate) struct IoChain {
    stages: Vec<Box<dyn IoStage>>,
}

impl IoChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts `stage` at `position` (0 is next to the socket).
    pub(crate) fn insert(&mut self, position: usize, stage: Box<dyn IoStage>) {
        let position = position.min(self.stages.len());
        self.stages.insert(position, stage);
    }

    /// Puts `stage` on top, next to the application.
    pub(crate) fn push(&mut self, stage: Box<dyn IoStage>) {
        self.stages.push(stage);
    }

    pub(crate) fn contains<T: IoStage + 'static>(&mut self) -> bool {
        self.position::<T>().is_some()
    }

    pub(crate) fn get_mut<T: IoStage + 'static>(&mut self) -> Option<&mut T> {
        self.stages
            .iter_mut()
            .find_map(|stage| stage.as_any_mut().downcast_mut::<T>())
    }

    /// Takes out the first stage of type `T`. What it still holds is released
    /// downward as if it closed gracefully.
    pub(crate) fn remove<T: IoStage + 'static>(&mut self) -> Result<ChainOutput, Error> {
        let mut out = ChainOutput::default();
        let Some(position) = self.position::<T>() else {
            return Ok(out);
        };
        let mut stage = self.stages.remove(position);
        let mut ctx = StageContext::default();
        stage.on_close(false, &mut ctx)?;
        out.absorb_signals(&mut ctx);
        // The removed stage's neighbours now meet at `position`.
        self.lower(position, ctx.outbound, &mut out)?;
        self.lift(position, ctx.inbound, &mut out)?;
        Ok(out)
    }

    /// Runs `f` on the first stage of type `T` and routes what it produced.
    /// Returns `None` if there is no such stage.
    pub(crate) fn with_stage<T, R, F>(&mut self, f: F) -> Result<Option<(R, ChainOutput)>, Error>
    where
        T: IoStage + 'static,
        F: FnOnce(&mut T, &mut StageContext) -> Result<R, Error>,
    {
        let Some(position) = self.position::<T>() else {
            return Ok(None);
        };
        let mut ctx = StageContext::default();
        let result = match self.stages[position].as_any_mut().downcast_mut::<T>() {
            Some(stage) => f(stage, &mut ctx)?,
            None => return Ok(None),
        };
        let mut out = ChainOutput::default();
        // Output of a stage above the socket continues with the next stage.
        self.route(position, ctx, &mut out)?;
        Ok(Some((result, out)))
    }

    /// Sends socket data up the stack.
    pub(crate) fn inbound(&mut self, data: Vec<Bytes>) -> Result<ChainOutput, Error> {
        let mut out = ChainOutput::default();
        self.lift(0, data, &mut out)?;
        Ok(out)
    }

    /// Sends application data down the stack.
    pub(crate) fn outbound(&mut self, data: Vec<Bytes>) -> Result<ChainOutput, Error> {
        let mut out = ChainOutput::default();
        let top = self.stages.len();
        self.lower(top, data, &mut out)?;
        Ok(out)
    }

    pub(crate) fn tick(&mut self, now: Instant) -> Result<ChainOutput, Error> {
        let mut out = ChainOutput::default();
        for position in 0..self.stages.len() {
            let mut ctx = StageContext::default();
            self.stages[position].on_tick(now, &mut ctx)?;
            self.route(position, ctx, &mut out)?;
        }
        Ok(out)
    }

    /// Closes every stage, top first, so held data drains through the stages
    /// below.
    pub(crate) fn close(&mut self, immediate: bool) -> Result<ChainOutput, Error> {
        let mut out = ChainOutput::default();
        for position in (0..self.stages.len()).rev() {
            let mut ctx = StageContext::default();
            self.stages[position].on_close(immediate, &mut ctx)?;
            self.route(position, ctx, &mut out)?;
        }
        Ok(out)
    }

    /// Maps socket-level written buffers to application buffers.
    pub(crate) fn written(&mut self, mut written: Vec<Bytes>) -> Vec<Bytes> {
        for stage in self.stages.iter_mut() {
            written = stage.on_written(written);
        }
        written
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.stages.iter().filter_map(|stage| stage.next_deadline()).min()
    }

    pub(crate) fn pending_size(&self) -> usize {
        self.stages.iter().map(|stage| stage.pending_size()).sum()
    }

    // ============================================================================
    // Internal Routing
    // ============================================================================

    fn position<T: IoStage + 'static>(&mut self) -> Option<usize> {
        self.stages
            .iter_mut()
            .position(|stage| stage.as_any_mut().is::<T>())
    }

    // Routes the output of the stage at `position`: inbound continues above
    // it, outbound continues below it.
    fn route(
        &mut self,
        position: usize,
        mut ctx: StageContext,
        out: &mut ChainOutput,
    ) -> Result<(), Error> {
        out.absorb_signals(&mut ctx);
        let inbound = std::mem::take(&mut ctx.inbound);
        let outbound = std::mem::take(&mut ctx.outbound);
        self.lower(position, outbound, out)?;
        self.lift(position + 1, inbound, out)
    }

    // Passes `data` through the stages at `from..` upward.
    fn lift(&mut self, from: usize, data: Vec<Bytes>, out: &mut ChainOutput) -> Result<(), Error> {
        let mut carry = data;
        for position in from..self.stages.len() {
            if carry.is_empty() {
                return Ok(());
            }
            let mut ctx = StageContext::default();
            self.stages[position].on_inbound(carry, &mut ctx)?;
            out.absorb_signals(&mut ctx);
            let outbound = std::mem::take(&mut ctx.outbound);
            self.lower(position, outbound, out)?;
            carry = ctx.inbound;
        }
        out.inbound.extend(carry);
        Ok(())
    }

    // Passes `data` through the stages below `until` downward.
    fn lower(&mut self, until: usize, data: Vec<Bytes>, out: &mut ChainOutput) -> Result<(), Error> {
        let mut carry = data;
        for position in (0..until).rev() {
            if carry.is_empty() {
                return Ok(());
            }
            let mut ctx = StageContext::default();
            self.stages[position].on_outbound(carry, &mut ctx)?;
            out.absorb_signals(&mut ctx);
            debug_assert!(ctx.inbound.is_empty(), "outbound handling produced inbound data");
            carry = ctx.outbound;
        }
        out.outbound.extend(carry);
        Ok(())
    }
}

/// Maps bytes written further down back to the buffers a stage was given.
///
/// Stages that transform or split outbound data record, per input buffer, how
/// many bytes they emitted for it. Written byte counts are then consumed in
/// order. Output that belongs to no input (handshake records) is recorded
/// with no buffer.
#[derive(Debug, Default)]
pub(crate) struct WrittenTracker {
    entries: VecDeque<(Option<Bytes>, usize)>,
}

impl WrittenTracker {
    pub(crate) fn record(&mut self, source: Option<Bytes>, emitted: usize) {
        if source.is_none() && emitted == 0 {
            return;
        }
        self.entries.push_back((source, emitted));
    }

    pub(crate) fn map(&mut self, written: Vec<Bytes>) -> Vec<Bytes> {
        let mut remaining: usize = written.iter().map(Bytes::len).sum();
        let mut sources = Vec::new();
        while let Some((_, emitted)) = self.entries.front_mut() {
            if *emitted > remaining {
                *emitted -= remaining;
                break;
            }
            remaining -= *emitted;
            if let Some((Some(source), _)) = self.entries.pop_front() {
                sources.push(source);
            }
        }
        sources
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Upper-cases inbound data and answers every inbound call with a "!".
    struct Shout;

    impl IoStage for Shout {
        fn name(&self) -> &'static str {
            "shout"
        }

        fn on_inbound(&mut self, data: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error> {
            for buffer in data {
                ctx.deliver(Bytes::from(buffer.to_ascii_uppercase()));
            }
            ctx.send(Bytes::from_static(b"!"));
            Ok(())
        }

        fn on_outbound(&mut self, data: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error> {
            for buffer in data {
                ctx.send(buffer);
            }
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    // Prefixes every outbound buffer with ">".
    struct Prefix;

    impl IoStage for Prefix {
        fn name(&self) -> &'static str {
            "prefix"
        }

        fn on_inbound(&mut self, data: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error> {
            for buffer in data {
                ctx.deliver(buffer);
            }
            Ok(())
        }

        fn on_outbound(&mut self, data: Vec<Bytes>, ctx: &mut StageContext) -> Result<(), Error> {
            for buffer in data {
                ctx.send(Bytes::from_static(b">"));
                ctx.send(buffer);
            }
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn empty_chain_passes_through() {
        let mut chain = IoChain::new();
        let out = chain.inbound(vec![Bytes::from_static(b"abc")]).unwrap();
        assert_eq!(out.inbound, vec![Bytes::from_static(b"abc")]);
        let out = chain.outbound(vec![Bytes::from_static(b"xyz")]).unwrap();
        assert_eq!(out.outbound, vec![Bytes::from_static(b"xyz")]);
    }

    #[test]
    fn stage_output_is_routed_through_remaining_stages() {
        let mut chain = IoChain::new();
        chain.push(Box::new(Prefix));
        chain.insert(1, Box::new(Shout));
        // Prefix at 0 (socket side), Shout at 1.

        let out = chain.inbound(vec![Bytes::from_static(b"hi")]).unwrap();
        assert_eq!(out.inbound, vec![Bytes::from_static(b"HI")]);
        // Shout's answer passed through Prefix on its way down.
        assert_eq!(
            out.outbound,
            vec![Bytes::from_static(b">"), Bytes::from_static(b"!")]
        );
    }

    #[test]
    fn removed_stage_is_not_consulted() {
        let mut chain = IoChain::new();
        chain.push(Box::new(Prefix));
        assert!(chain.contains::<Prefix>());
        chain.remove::<Prefix>().unwrap();
        assert!(!chain.contains::<Prefix>());
        let out = chain.outbound(vec![Bytes::from_static(b"x")]).unwrap();
        assert_eq!(out.outbound, vec![Bytes::from_static(b"x")]);
    }

    #[test]
    fn tracker_reports_sources_once_fully_written() {
        let mut tracker = WrittenTracker::default();
        tracker.record(None, 3);
        tracker.record(Some(Bytes::from_static(b"first")), 10);
        tracker.record(Some(Bytes::from_static(b"second")), 4);

        assert!(tracker.map(vec![Bytes::from(vec![0u8; 8])]).is_empty());
        assert_eq!(
            tracker.map(vec![Bytes::from(vec![0u8; 5])]),
            vec![Bytes::from_static(b"first")]
        );
        assert_eq!(
            tracker.map(vec![Bytes::from(vec![0u8; 4])]),
            vec![Bytes::from_static(b"second")]
        );
    }
}
