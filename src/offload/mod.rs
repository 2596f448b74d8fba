/*!
# TCP Receive Aggregation

[`GroEngine`] coalesces consecutive TCP segments of one flow into a single
larger frame. Each flow is identified by a caller-chosen 64-bit context
address; its state ([`AggregationContext`]) lives in a [`ContextStore`] and
is only ever touched under that address's lock.

Three entry points drive a flow:

- [`GroEngine::aggregate_segment`] for every arriving segment,
- [`GroEngine::flush_aggregation`] to close whatever is pending,
- [`GroEngine::timeout_callback`] when the flow's timer fires.

Every call reports a [`Disposition`] and hands back the frames to emit in
a [`GroOutput`]. Resource exhaustion never surfaces as an error: it turns
into a synchronous-flush or discard disposition and is counted.

```
use gro_rs::{AggregationParams, Disposition, Frame, GroEngine, GroFlags};

let engine: GroEngine = GroEngine::default();
let params = AggregationParams::builder().build()?;
# let mut pkt = vec![0u8; 60];
# pkt[0] = 0x45; pkt[3] = 60; pkt[8] = 64; pkt[9] = 6; pkt[32] = 0x50; pkt[33] = 0x10;
let out = engine.aggregate_segment(0x10, Frame::ip(&pkt[..]), &params, GroFlags::empty());
assert!(out.disposition.contains(Disposition::NEW_AGGREGATION_STARTED));

let out = engine.flush_aggregation(0x10);
assert_eq!(out.disposition, Disposition::FLUSH_AGG_DONE);
assert_eq!(out.aggregate.map(|a| a.len()), Some(60));
# Ok::<(), std::io::Error>(())
```
*/

mod coalesce;
mod context;
mod disposition;
mod finalize;

pub use context::{AggregationContext, ContextFlags};
pub use disposition::{Aggregate, AggregateInfo, Disposition, GroOutput, TimeoutFlush};

use crate::parse;
use crate::{
    AggregationParams, ContextStore, CounterBank, CounterEngine, DeadlineTimers, Frame,
    FramePool, FrameTransport, GroCounter, GroFlags, MetadataMemory, MetadataSink, TimerEvent,
    TimerService,
};
use coalesce::Segment;

/// The aggregation engine together with the services it runs on.
///
/// All methods take `&self`; the engine is shared between worker threads
/// (typically behind an `Arc`) and serializes per flow through the
/// context store.
pub struct GroEngine<F = FramePool, T = DeadlineTimers, C = CounterBank, M = MetadataMemory> {
    store: ContextStore,
    frames: F,
    timers: T,
    counters: C,
    metadata: M,
}

impl Default for GroEngine {
    fn default() -> Self {
        GroEngine::new(
            FramePool::default(),
            DeadlineTimers::default(),
            CounterBank::default(),
            MetadataMemory::default(),
        )
    }
}

impl<F, T, C, M> GroEngine<F, T, C, M>
where
    F: FrameTransport,
    T: TimerService,
    C: CounterEngine,
    M: MetadataSink,
{
    pub fn new(frames: F, timers: T, counters: C, metadata: M) -> Self {
        GroEngine {
            store: ContextStore::default(),
            frames,
            timers,
            counters,
            metadata,
        }
    }
    /// Replaces the context store, e.g. to change its shard count.
    pub fn with_store(mut self, store: ContextStore) -> Self {
        self.store = store;
        self
    }
    pub fn store(&self) -> &ContextStore {
        &self.store
    }
    pub fn frames(&self) -> &F {
        &self.frames
    }
    pub fn timers(&self) -> &T {
        &self.timers
    }
    pub fn counters(&self) -> &C {
        &self.counters
    }
    pub fn metadata(&self) -> &M {
        &self.metadata
    }
    /// Copy of the committed state of the flow at `context_addr`.
    pub fn context(&self, context_addr: u64) -> AggregationContext {
        self.store.snapshot(context_addr)
    }

    /// Offers one arriving segment to the flow at `context_addr`.
    ///
    /// A frame carrying the transport error bit, or one that does not parse
    /// as TCP over IP, is returned with [`Disposition::BAD_FRAME`] and the
    /// flow is left alone. Otherwise the flow's lock is held for the whole
    /// decision and released before returning.
    pub fn aggregate_segment(
        &self,
        context_addr: u64,
        frame: Frame,
        params: &AggregationParams,
        flags: GroFlags,
    ) -> GroOutput {
        if frame.has_error() {
            return GroOutput::pass_through(Disposition::BAD_FRAME, frame);
        }
        let view = match parse::parse(&frame) {
            Ok(view) => view,
            Err(e) => {
                log::trace!("context {context_addr:#x}: rejecting frame, {e}");
                return GroOutput::pass_through(Disposition::BAD_FRAME, frame);
            }
        };
        let segment = Segment { frame, view };

        let mut ctx = self.store.lock(context_addr);
        let output = if ctx.is_active() {
            self.add_segment(&mut ctx, segment, params, flags)
        } else {
            self.start_aggregation(&mut ctx, segment, params, flags)
        };
        ctx.commit();
        output
    }

    /// Closes the aggregation pending on `context_addr`, if any.
    ///
    /// Returns [`Disposition::NO_AGGREGATION`] when the flow is idle and
    /// [`Disposition::FLUSH_AGG_DONE`] with the finalized aggregate otherwise.
    pub fn flush_aggregation(&self, context_addr: u64) -> GroOutput {
        let mut ctx = self.store.lock(context_addr);
        if !ctx.is_active() {
            ctx.abort();
            return GroOutput::new(Disposition::NO_AGGREGATION);
        }
        if let Some(timer) = ctx.timer.take() {
            self.timers.delete_timer(timer);
        }
        if ctx.flags.contains(ContextFlags::EXTENDED_STATS) {
            self.count(ctx.stats_base, GroCounter::FlushRequests, 1);
        }
        log::debug!(
            "context {context_addr:#x}: explicit flush of {} segments",
            ctx.segment_count
        );
        let aggregate = self.finalize(&mut ctx);
        ctx.commit();
        GroOutput::closed(aggregate, Disposition::FLUSH_AGG_DONE)
    }

    /// Handles an expired timer.
    ///
    /// Events whose handle no longer matches the flow's current timer are
    /// stale (the aggregation was closed, and possibly reopened, after the
    /// timer fired) and leave the flow untouched. Otherwise the aggregate is
    /// finalized and passed to the completion callback registered with the
    /// timer, after the flow's lock has been released.
    pub fn timeout_callback(&self, event: TimerEvent) {
        let context_addr = event.context_addr;
        let mut ctx = self.store.lock(context_addr);
        if !ctx.is_active() || ctx.timer != Some(event.handle) {
            ctx.abort();
            self.timers.ack_fired(event.handle);
            log::trace!("context {context_addr:#x}: ignoring stale timer {:?}", event.handle);
            return;
        }
        ctx.timer = None;
        self.count(ctx.stats_base, GroCounter::TimeoutFlushes, 1);
        log::debug!(
            "context {context_addr:#x}: timeout flush of {} segments",
            ctx.segment_count
        );
        let aggregate = self.finalize(&mut ctx);
        ctx.commit();
        self.timers.ack_fired(event.handle);

        match (aggregate, event.completion) {
            (Some(aggregate), Some(completion)) => (completion.callback)(TimeoutFlush {
                context_addr,
                aggregate,
                arg: completion.arg,
            }),
            (Some(aggregate), None) => log::warn!(
                "context {context_addr:#x}: no completion registered, dropping {} byte aggregate",
                aggregate.len()
            ),
            (None, _) => {}
        }
    }

    fn count(&self, stats_base: u64, counter: GroCounter, amount: u64) {
        self.counters.increment(counter.addr(stats_base), amount);
    }
}
