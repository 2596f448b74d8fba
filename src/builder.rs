/*!
# Aggregation Parameters Builder

This module provides [`AggregationParamsBuilder`] for configuring the limits,
timeout policy and statistics layout the engine applies to a flow.

## Basic Usage

```
use gro_rs::{AggregationParams, TimerGranularity};

let params = AggregationParams::builder()
    .seg_num_limit(32)
    .packet_size_limit(9000)
    .timeout_limit(5)
    .granularity(TimerGranularity::Millis10)
    .stats_base(0x1000)
    .metadata_base(0x8000)
    .build()?;
assert_eq!(params.seg_num_limit(), 32);
# Ok::<(), std::io::Error>(())
```

## Timeout Completion

When an aggregation times out there is no caller waiting for the frame, so
the finalized aggregate is handed to a completion callback registered here:

```
use gro_rs::AggregationParams;

let params = AggregationParams::builder()
    .on_timeout(|flush| println!("flow {:#x}: {} bytes", flush.context_addr, flush.aggregate.len()), 7)
    .build()?;
# Ok::<(), std::io::Error>(())
```

## Defaults

- `seg_num_limit`: 64
- `packet_size_limit`: 65535
- `timeout_limit`: 10 ticks of [`TimerGranularity::Millis1`], timer pool 0
- `stats_base`, `metadata_base`: 0
- extended statistics: off
*/

use crate::{Completion, GroError, TimeoutFlush, TimerGranularity, TimerRequest};
use std::io;

/// Default maximum number of segments in one aggregate.
pub const DEFAULT_SEG_NUM_LIMIT: u16 = 64;
/// Default (and largest) aggregate size in bytes.
pub const DEFAULT_PACKET_SIZE_LIMIT: u32 = u16::MAX as u32;
/// Default aggregation timeout in granularity ticks.
pub const DEFAULT_TIMEOUT_LIMIT: u16 = 10;

bitflags::bitflags! {
    /// Per-call options of [`GroEngine::aggregate_segment`](crate::GroEngine::aggregate_segment).
    ///
    /// The flags given when an aggregation starts apply to it until it is
    /// finalized, including a finalization by explicit flush or timeout.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GroFlags: u8 {
        /// Log every segment's size to the flow's metadata area.
        const LOG_SEGMENT_SIZES = 1 << 0;
        /// Write a complete TCP checksum into multi-segment aggregates
        /// instead of the pseudo-header sum.
        const TCP_CHECKSUM = 1 << 1;
    }
}

/// How long an aggregation may stay open and whom to tell when it times out.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    pub(crate) timeout_limit: u16,
    pub(crate) granularity: TimerGranularity,
    pub(crate) timer_pool_id: u16,
    pub(crate) completion: Option<Completion>,
}

/// Limits and policy applied to one aggregate call.
///
/// Built with [`AggregationParams::builder`]. Cloning is cheap; the
/// completion callback is shared.
#[derive(Debug, Clone)]
pub struct AggregationParams {
    pub(crate) seg_num_limit: u16,
    pub(crate) packet_size_limit: u32,
    pub(crate) timeout: TimeoutPolicy,
    pub(crate) stats_base: u64,
    pub(crate) metadata_base: u64,
    pub(crate) extended_stats: bool,
}

impl AggregationParams {
    pub fn builder() -> AggregationParamsBuilder {
        AggregationParamsBuilder::new()
    }
    pub fn seg_num_limit(&self) -> u16 {
        self.seg_num_limit
    }
    pub fn packet_size_limit(&self) -> u32 {
        self.packet_size_limit
    }
    pub fn timeout(&self) -> &TimeoutPolicy {
        &self.timeout
    }
    pub fn stats_base(&self) -> u64 {
        self.stats_base
    }
    pub fn metadata_base(&self) -> u64 {
        self.metadata_base
    }
    pub fn extended_stats(&self) -> bool {
        self.extended_stats
    }

    pub(crate) fn timer_request(&self, context_addr: u64) -> TimerRequest {
        TimerRequest {
            pool_id: self.timeout.timer_pool_id,
            duration: self.timeout.timeout_limit,
            granularity: self.timeout.granularity,
            context_addr,
            completion: self.timeout.completion.clone(),
        }
    }
}

impl TimeoutPolicy {
    pub fn timeout_limit(&self) -> u16 {
        self.timeout_limit
    }
    pub fn granularity(&self) -> TimerGranularity {
        self.granularity
    }
    pub fn timer_pool_id(&self) -> u16 {
        self.timer_pool_id
    }
    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }
}

/// Builder for [`AggregationParams`]; unset fields take the module defaults.
#[derive(Debug, Clone, Default)]
pub struct AggregationParamsBuilder {
    seg_num_limit: Option<u16>,
    packet_size_limit: Option<u32>,
    timeout_limit: Option<u16>,
    granularity: Option<TimerGranularity>,
    timer_pool_id: Option<u16>,
    completion: Option<Completion>,
    stats_base: Option<u64>,
    metadata_base: Option<u64>,
    extended_stats: Option<bool>,
}

impl AggregationParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    /// Maximum number of segments merged into one aggregate.
    /// A limit of 0 or 1 disables aggregation.
    pub fn seg_num_limit(mut self, seg_num_limit: u16) -> Self {
        self.seg_num_limit = Some(seg_num_limit);
        self
    }
    /// Maximum size in bytes of an aggregate, headers included.
    pub fn packet_size_limit(mut self, packet_size_limit: u32) -> Self {
        self.packet_size_limit = Some(packet_size_limit);
        self
    }
    /// Timer duration in units of the configured granularity.
    pub fn timeout_limit(mut self, timeout_limit: u16) -> Self {
        self.timeout_limit = Some(timeout_limit);
        self
    }
    pub fn granularity(mut self, granularity: TimerGranularity) -> Self {
        self.granularity = Some(granularity);
        self
    }
    /// Timer pool the aggregation timers are taken from.
    pub fn timer_pool(mut self, timer_pool_id: u16) -> Self {
        self.timer_pool_id = Some(timer_pool_id);
        self
    }
    /// Callback receiving aggregates finalized by a timeout, with an opaque argument.
    pub fn on_timeout<F>(mut self, callback: F, arg: u64) -> Self
    where
        F: Fn(TimeoutFlush) + Send + Sync + 'static,
    {
        self.completion = Some(Completion::new(callback, arg));
        self
    }
    pub fn completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }
    /// Base address of the flow's statistics counters.
    pub fn stats_base(mut self, stats_base: u64) -> Self {
        self.stats_base = Some(stats_base);
        self
    }
    /// Base address of the flow's metadata area.
    pub fn metadata_base(mut self, metadata_base: u64) -> Self {
        self.metadata_base = Some(metadata_base);
        self
    }
    /// Also maintain the aggregated-segments accumulator and flush-request counter.
    pub fn extended_stats(mut self, extended_stats: bool) -> Self {
        self.extended_stats = Some(extended_stats);
        self
    }

    /// Validates the configuration and builds the parameters.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `packet_size_limit` exceeds 65535 or
    /// `timeout_limit` is zero.
    pub fn build(self) -> io::Result<AggregationParams> {
        let packet_size_limit = self.packet_size_limit.unwrap_or(DEFAULT_PACKET_SIZE_LIMIT);
        if packet_size_limit > DEFAULT_PACKET_SIZE_LIMIT {
            return Err(GroError::InvalidParams("packet_size_limit exceeds 65535").into());
        }
        let timeout_limit = self.timeout_limit.unwrap_or(DEFAULT_TIMEOUT_LIMIT);
        if timeout_limit == 0 {
            return Err(GroError::InvalidParams("timeout_limit must be at least 1").into());
        }
        Ok(AggregationParams {
            seg_num_limit: self.seg_num_limit.unwrap_or(DEFAULT_SEG_NUM_LIMIT),
            packet_size_limit,
            timeout: TimeoutPolicy {
                timeout_limit,
                granularity: self.granularity.unwrap_or_default(),
                timer_pool_id: self.timer_pool_id.unwrap_or(0),
                completion: self.completion,
            },
            stats_base: self.stats_base.unwrap_or(0),
            metadata_base: self.metadata_base.unwrap_or(0),
            extended_stats: self.extended_stats.unwrap_or(false),
        })
    }
}
