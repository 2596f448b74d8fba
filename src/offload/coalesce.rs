use super::context::{AggregationContext, ContextFlags};
use super::disposition::{Aggregate, Disposition, GroOutput};
use super::finalize::AggregateBuilder;
use super::GroEngine;
use crate::parse::ParsedHeaders;
use crate::{
    AggregationParams, ContextGuard, CounterEngine, Frame, FrameTransport, GroCounter, GroError,
    GroFlags, MetadataSink, TimerHandle, TimerService, METADATA_SEGMENT_COUNT_OFFSET,
    METADATA_SEGMENT_SIZES_OFFSET,
};

/// An arriving frame together with its parsed headers.
pub(super) struct Segment {
    pub(super) frame: Frame,
    pub(super) view: ParsedHeaders,
}

impl Segment {
    fn len(&self) -> usize {
        self.frame.len()
    }

    /// Whether this segment cannot open an aggregation under `params`.
    fn cannot_seed(&self, params: &AggregationParams) -> bool {
        self.view.psh()
            || !self.view.is_coalescible()
            || params.seg_num_limit <= 1
            || params.packet_size_limit as usize <= self.len()
    }
}

impl<F, T, C, M> GroEngine<F, T, C, M>
where
    F: FrameTransport,
    T: TimerService,
    C: CounterEngine,
    M: MetadataSink,
{
    pub(super) fn start_aggregation(
        &self,
        ctx: &mut ContextGuard,
        segment: Segment,
        params: &AggregationParams,
        flags: GroFlags,
    ) -> GroOutput {
        let addr = ctx.addr();
        if segment.cannot_seed(params) {
            log::trace!("context {addr:#x}: segment passes through");
            return GroOutput::pass_through(Disposition::FLUSH_NOW, segment.frame);
        }
        let timer = match self.timers.create_timer(params.timer_request(addr)) {
            Ok(timer) => timer,
            Err(e) => {
                log::warn!("context {addr:#x}: {e}, flushing segment synchronously");
                self.count(params.stats_base, GroCounter::TimerUnavailable, 1);
                return GroOutput::pass_through(Disposition::TIMER_UNAVAILABLE, segment.frame);
            }
        };
        match self.seed(ctx, segment, timer, params, flags) {
            Ok(()) => GroOutput::new(Disposition::NEW_AGGREGATION_STARTED),
            Err(_) => GroOutput::new(Disposition::SEGMENT_DISCARDED),
        }
    }

    pub(super) fn add_segment(
        &self,
        ctx: &mut ContextGuard,
        segment: Segment,
        params: &AggregationParams,
        flags: GroFlags,
    ) -> GroOutput {
        let addr = ctx.addr();
        let view = &segment.view;
        if view.seq() != ctx.next_expected_seq {
            log::debug!(
                "context {addr:#x}: expected seq {}, got {}",
                ctx.next_expected_seq,
                view.seq()
            );
            self.count(ctx.stats_base, GroCounter::UnexpectedSeq, 1);
            return self.close_and_reopen(ctx, segment, params, flags);
        }
        if ctx.headers_mismatch(view)
            || ctx.ack_regressed(view)
            || ctx.flush_required()
            || !view.is_coalescible()
        {
            log::debug!("context {addr:#x}: segment cannot continue the aggregate");
            return self.close_and_reopen(ctx, segment, params, flags);
        }

        // An oversized PSH segment is handed back by close-and-reopen, never merged.
        let aggregated_size = ctx.aggregate_len as usize + segment.len() - view.headers_len();
        let size_limit = params.packet_size_limit as usize;
        if aggregated_size > size_limit {
            log::debug!("context {addr:#x}: {aggregated_size} bytes would exceed {size_limit}");
            return self.close_and_reopen(ctx, segment, params, flags);
        }
        if view.psh()
            || aggregated_size == size_limit
            || ctx.segment_count + 1 >= params.seg_num_limit as u32
        {
            return self.add_and_close(ctx, segment);
        }

        match self.append(ctx, &segment) {
            Ok(()) => GroOutput::new(Disposition::AGGREGATED),
            Err(e) => {
                log::warn!("context {addr:#x}: {e} while appending");
                self.discard_aggregation(ctx)
            }
        }
    }

    /// Merges `segment` and closes the aggregate.
    fn add_and_close(&self, ctx: &mut ContextGuard, segment: Segment) -> GroOutput {
        let addr = ctx.addr();
        if let Some(timer) = ctx.timer.take() {
            self.timers.delete_timer(timer);
        }
        if let Err(e) = self.append(ctx, &segment) {
            log::warn!("context {addr:#x}: {e} while appending the closing segment");
            return self.discard_aggregation(ctx);
        }
        let aggregate = self.finalize(ctx);
        GroOutput::closed(aggregate, Disposition::FLUSH_NOW)
    }

    /// Closes the aggregate without `segment`, which then either seeds the
    /// next aggregation or is emitted right after it.
    fn close_and_reopen(
        &self,
        ctx: &mut ContextGuard,
        segment: Segment,
        params: &AggregationParams,
        flags: GroFlags,
    ) -> GroOutput {
        let addr = ctx.addr();
        let timer = ctx.timer.take();

        if segment.cannot_seed(params) {
            if let Some(timer) = timer {
                self.timers.delete_timer(timer);
            }
            let aggregate = self.finalize(ctx);
            let mut output = GroOutput::closed(aggregate, Disposition::FLUSH_NOW);
            match self.stage_output(segment.frame) {
                Ok(frame) => output.segment = Some(frame),
                Err(e) => {
                    log::warn!("context {addr:#x}: {e}, dropping the closing segment");
                    self.count(params.stats_base, GroCounter::DiscardedSegments, 1);
                    output.disposition |= Disposition::SEGMENT_DISCARDED;
                }
            }
            return output;
        }

        let aggregate = self.finalize(ctx);
        let mut output = GroOutput::closed(aggregate, Disposition::FLUSH_NOW);
        let timer = match self.reuse_timer(addr, timer, params) {
            Ok(timer) => timer,
            Err(e) => {
                log::warn!("context {addr:#x}: {e}, flushing segment synchronously");
                self.count(params.stats_base, GroCounter::TimerUnavailable, 1);
                output.disposition |= Disposition::FLUSH_NOW | Disposition::TIMER_UNAVAILABLE;
                output.segment = Some(segment.frame);
                return output;
            }
        };
        output.disposition |= match self.seed(ctx, segment, timer, params, flags) {
            Ok(()) => Disposition::NEW_AGGREGATION_STARTED,
            Err(_) => Disposition::SEGMENT_DISCARDED,
        };
        output
    }

    /// Recharges the timer the closed aggregation owned, or arms a fresh
    /// one when it is gone (deleted, or fired and not yet delivered).
    fn reuse_timer(
        &self,
        addr: u64,
        timer: Option<TimerHandle>,
        params: &AggregationParams,
    ) -> Result<TimerHandle, GroError> {
        if let Some(timer) = timer {
            match self.timers.recharge_timer(timer) {
                Ok(()) => return Ok(timer),
                Err(e) => {
                    log::trace!("context {addr:#x}: {e}, arming a new timer");
                    self.timers.delete_timer(timer);
                }
            }
        }
        self.timers.create_timer(params.timer_request(addr))
    }

    /// Stores `segment` and opens an aggregation around it with `timer`.
    /// On buffer exhaustion the timer is released and the segment dropped.
    fn seed(
        &self,
        ctx: &mut ContextGuard,
        segment: Segment,
        timer: TimerHandle,
        params: &AggregationParams,
        flags: GroFlags,
    ) -> Result<(), GroError> {
        let handle = match self.frames.store(&segment.frame) {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("context {:#x}: {e}, dropping segment", ctx.addr());
                self.timers.delete_timer(timer);
                self.count(params.stats_base, GroCounter::DiscardedSegments, 1);
                ctx.reset();
                return Err(e);
            }
        };
        ctx.seed(&segment.view, segment.len(), timer, handle, params, flags);
        self.log_segment_size(ctx, &segment.view);
        self.count(ctx.stats_base, GroCounter::Segments, 1);
        log::trace!(
            "context {:#x}: started aggregation at seq {}",
            ctx.addr(),
            segment.view.seq()
        );
        Ok(())
    }

    fn append(&self, ctx: &mut AggregationContext, segment: &Segment) -> Result<(), GroError> {
        let head = ctx
            .frame
            .ok_or(GroError::Malformed("aggregation has no stored frame"))?;
        let len = self
            .frames
            .concatenate(head, &segment.frame, segment.view.headers_len())?;
        ctx.absorb(&segment.view, len);
        self.log_segment_size(ctx, &segment.view);
        self.count(ctx.stats_base, GroCounter::Segments, 1);
        log::trace!(
            "aggregated segment {} ({} bytes total)",
            ctx.segment_count,
            ctx.aggregate_len
        );
        Ok(())
    }

    /// Drops the in-flight aggregate after a failed append.
    fn discard_aggregation(&self, ctx: &mut AggregationContext) -> GroOutput {
        if let Some(timer) = ctx.timer.take() {
            self.timers.delete_timer(timer);
        }
        if let Some(frame) = ctx.frame.take() {
            self.frames.discard(frame);
        }
        log::warn!("discarding aggregate of {} segments", ctx.segment_count);
        self.count(
            ctx.stats_base,
            GroCounter::DiscardedSegments,
            ctx.segment_count as u64,
        );
        ctx.reset();
        GroOutput::new(Disposition::AGGREGATION_DISCARDED)
    }

    /// Finalizes the stored aggregate, records its segment count and resets
    /// the context. The caller has already dealt with the timer.
    pub(super) fn finalize(&self, ctx: &mut AggregationContext) -> Option<Aggregate> {
        let segment_count = ctx.segment_count;
        let result = ctx
            .frame
            .take()
            .and_then(|handle| self.frames.take(handle))
            .ok_or(GroError::Malformed("aggregate frame missing from transport"))
            .and_then(|frame| AggregateBuilder::finish(frame, ctx));
        self.metadata.write(
            ctx.metadata_addr + METADATA_SEGMENT_COUNT_OFFSET,
            &segment_count.to_be_bytes(),
        );
        let aggregate = match result {
            Ok(aggregate) => {
                let counter = GroCounter::Aggregations.addr(ctx.stats_base);
                if ctx.flags.contains(ContextFlags::EXTENDED_STATS) {
                    self.counters
                        .increment_pair(counter, 1, segment_count as u64);
                } else {
                    self.counters.increment(counter, 1);
                }
                Some(aggregate)
            }
            Err(e) => {
                log::warn!("dropping aggregate of {segment_count} segments: {e}");
                self.count(
                    ctx.stats_base,
                    GroCounter::DiscardedSegments,
                    segment_count as u64,
                );
                None
            }
        };
        ctx.reset();
        aggregate
    }

    /// Moves a segment that closes an aggregation into transport storage
    /// as a frame of its own, ready to follow the aggregate out.
    fn stage_output(&self, frame: Frame) -> Result<Frame, GroError> {
        let handle = self.frames.store(&frame)?;
        self.frames
            .take(handle)
            .ok_or(GroError::Malformed("staged frame vanished from transport"))
    }

    fn log_segment_size(&self, ctx: &mut AggregationContext, view: &ParsedHeaders) {
        if !ctx.flags.contains(ContextFlags::LOG_SEGMENT_SIZES) {
            return;
        }
        let addr =
            ctx.metadata_addr + METADATA_SEGMENT_SIZES_OFFSET + 2 * ctx.metadata_cursor as u64;
        self.metadata
            .write(addr, &(view.payload_len() as u16).to_be_bytes());
        ctx.metadata_cursor = ctx.metadata_cursor.wrapping_add(1);
    }
}
