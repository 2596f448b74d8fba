//! Services the aggregation engine is built on: frame storage, the per-flow
//! context store, deadline timers, statistics counters and the metadata sink.
//!
//! Each service is a trait (where the engine is generic over it) with an
//! in-memory implementation suitable for software data planes and tests.

mod counters;
mod frame;
mod metadata;
mod store;
mod timer;

pub use counters::{CounterBank, CounterEngine, GroCounter, GroStats};
pub use frame::{
    Frame, FrameHandle, FramePool, FrameTransport, LinkType, DEFAULT_POOL_BYTES,
    DEFAULT_POOL_FRAMES,
};
pub use metadata::{
    MetadataMemory, MetadataSink, METADATA_SEGMENT_COUNT_OFFSET, METADATA_SEGMENT_SIZES_OFFSET,
};
pub use store::{ContextGuard, ContextStore, DEFAULT_STORE_SHARDS};
pub use timer::{
    Completion, DeadlineTimers, FlushCallback, TimerEvent, TimerGranularity, TimerHandle,
    TimerRequest, TimerService, DEFAULT_TIMER_SLOTS,
};
