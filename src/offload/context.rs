use crate::parse::{IpFields, ParsedHeaders, SegmentTrailer, TcpOptions};
use crate::{AggregationParams, FrameHandle, GroFlags, TimerHandle};

bitflags::bitflags! {
    /// Internal state bits of an [`AggregationContext`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u8 {
        /// ECN codepoint captured when the aggregation started (two bits).
        const ECN_LOW = 1 << 0;
        const ECN_HIGH = 1 << 1;
        const HAS_TIMESTAMP = 1 << 2;
        /// The next arriving segment must close the aggregate.
        const FLUSH_REQUIRED = 1 << 3;
        const LOG_SEGMENT_SIZES = 1 << 4;
        const TCP_CHECKSUM = 1 << 5;
        const EXTENDED_STATS = 1 << 6;
    }
}

const ECN_BITS: u8 = 0b11;

/// Per-flow aggregation state, persisted in the
/// [`ContextStore`](crate::ContextStore) between calls.
///
/// `segment_count() == 0` means no aggregation is in progress; in that state
/// no timer is owned and no frame is held. While `segment_count() > 0` the
/// context owns exactly one timer and one stored frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationContext {
    pub(crate) segment_count: u32,
    pub(crate) max_segment_size: u16,
    pub(crate) next_expected_seq: u32,
    pub(crate) last_ack_seen: u32,
    pub(crate) ts_value: u32,
    pub(crate) flags: ContextFlags,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) frame: Option<FrameHandle>,
    pub(crate) aggregate_len: u32,
    pub(crate) headers_len: u16,
    pub(crate) ip_fields: IpFields,
    pub(crate) tcp_options: TcpOptions,
    pub(crate) trailer: SegmentTrailer,
    pub(crate) stats_base: u64,
    pub(crate) metadata_addr: u64,
    pub(crate) metadata_cursor: u16,
}

impl AggregationContext {
    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }
    pub fn is_active(&self) -> bool {
        self.segment_count > 0
    }
    /// Largest TCP payload merged so far.
    pub fn max_segment_size(&self) -> u16 {
        self.max_segment_size
    }
    /// Sequence number of the first byte not yet aggregated.
    pub fn next_expected_seq(&self) -> u32 {
        self.next_expected_seq
    }
    pub fn last_ack_seen(&self) -> u32 {
        self.last_ack_seen
    }
    pub fn ecn(&self) -> u8 {
        self.flags.bits() & ECN_BITS
    }
    /// TSval captured from the first segment, if it carried the option.
    pub fn timestamp(&self) -> Option<u32> {
        self.flags
            .contains(ContextFlags::HAS_TIMESTAMP)
            .then_some(self.ts_value)
    }
    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer
    }
    pub fn frame(&self) -> Option<FrameHandle> {
        self.frame
    }
    /// Current byte length of the stored aggregate.
    pub fn aggregate_len(&self) -> u32 {
        self.aggregate_len
    }
    /// L2..L4 header length of the aggregate's first segment.
    pub fn headers_len(&self) -> u16 {
        self.headers_len
    }
    pub fn trailer(&self) -> SegmentTrailer {
        self.trailer
    }
    pub fn context_flags(&self) -> ContextFlags {
        self.flags
    }
    /// Set once a segment shorter than the largest one was merged: nothing
    /// may follow it inside the same aggregate.
    pub fn flush_required(&self) -> bool {
        self.flags.contains(ContextFlags::FLUSH_REQUIRED)
    }

    pub(crate) fn reset(&mut self) {
        *self = AggregationContext::default();
    }

    /// Initialises a fresh aggregation around `view`, whose frame is already
    /// stored under `frame` and whose timer is `timer`.
    pub(crate) fn seed(
        &mut self,
        view: &ParsedHeaders,
        segment_len: usize,
        timer: TimerHandle,
        frame: FrameHandle,
        params: &AggregationParams,
        gro_flags: GroFlags,
    ) {
        let mut flags = ContextFlags::from_bits_truncate(view.ecn() & ECN_BITS);
        if let Some(ts) = view.timestamp() {
            flags |= ContextFlags::HAS_TIMESTAMP;
            self.ts_value = ts.value;
        } else {
            self.ts_value = 0;
        }
        flags.set(
            ContextFlags::LOG_SEGMENT_SIZES,
            gro_flags.contains(GroFlags::LOG_SEGMENT_SIZES),
        );
        flags.set(
            ContextFlags::TCP_CHECKSUM,
            gro_flags.contains(GroFlags::TCP_CHECKSUM),
        );
        flags.set(ContextFlags::EXTENDED_STATS, params.extended_stats);

        self.segment_count = 1;
        self.max_segment_size = view.payload_len() as u16;
        self.next_expected_seq = view.seq().wrapping_add(view.payload_len() as u32);
        self.last_ack_seen = view.ack();
        self.flags = flags;
        self.timer = Some(timer);
        self.frame = Some(frame);
        self.aggregate_len = segment_len as u32;
        self.headers_len = view.headers_len() as u16;
        self.ip_fields = view.ip_fields();
        self.tcp_options = *view.options();
        self.trailer = view.trailer();
        self.stats_base = params.stats_base;
        self.metadata_addr = params.metadata_base;
        self.metadata_cursor = 0;
    }

    /// Accounts for `view` having been appended; `aggregate_len` is the new
    /// stored length.
    pub(crate) fn absorb(&mut self, view: &ParsedHeaders, aggregate_len: usize) {
        let payload_len = view.payload_len() as u16;
        if payload_len < self.max_segment_size {
            self.flags.insert(ContextFlags::FLUSH_REQUIRED);
        }
        self.segment_count += 1;
        self.max_segment_size = self.max_segment_size.max(payload_len);
        self.next_expected_seq = view.seq().wrapping_add(view.payload_len() as u32);
        self.last_ack_seen = view.ack();
        self.trailer = view.trailer();
        self.aggregate_len = aggregate_len as u32;
    }

    /// Whether `view` cannot continue this aggregate for header reasons:
    /// ECN, timestamp value, header layout, the IP fields in [`IpFields`]
    /// or any TCP option byte other than the echo reply differ.
    pub(crate) fn headers_mismatch(&self, view: &ParsedHeaders) -> bool {
        view.ecn() != self.ecn()
            || view.timestamp().map(|ts| ts.value) != self.timestamp()
            || view.headers_len() != self.headers_len as usize
            || view.ip_fields() != self.ip_fields
            || *view.options() != self.tcp_options
    }

    /// Whether `view` acknowledges less than the aggregate already did, in
    /// TCP sequence space.
    pub(crate) fn ack_regressed(&self, view: &ParsedHeaders) -> bool {
        (view.ack().wrapping_sub(self.last_ack_seen) as i32) < 0
    }
}
