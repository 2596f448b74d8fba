use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Saturating statistics counters addressed by a 64-bit counter address.
///
/// Implementations provide their own atomicity; the engine never locks
/// around them.
pub trait CounterEngine: Send + Sync {
    fn increment(&self, addr: u64, amount: u64);
    /// Bumps the counter at `addr` by `amount` and its accumulator at
    /// `addr + 8` by `accumulate`.
    fn increment_pair(&self, addr: u64, amount: u64, accumulate: u64);
}

/// In-memory [`CounterEngine`]. Counters spring into existence at zero.
#[derive(Default)]
pub struct CounterBank {
    counters: RwLock<HashMap<u64, Arc<AtomicU64>>>,
}

impl CounterBank {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, addr: u64) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.read().get(&addr) {
            return counter.clone();
        }
        self.counters.write().entry(addr).or_default().clone()
    }

    pub fn read(&self, addr: u64) -> u64 {
        self.counters
            .read()
            .get(&addr)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn saturating_add(counter: &AtomicU64, amount: u64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
            Some(value.saturating_add(amount))
        });
    }
}

impl CounterEngine for CounterBank {
    fn increment(&self, addr: u64, amount: u64) {
        Self::saturating_add(&self.counter(addr), amount);
    }

    fn increment_pair(&self, addr: u64, amount: u64, accumulate: u64) {
        Self::saturating_add(&self.counter(addr), amount);
        Self::saturating_add(&self.counter(addr.wrapping_add(8)), accumulate);
    }
}

/// Counters maintained by the engine, laid out 8 bytes apart from a flow's
/// `stats_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum GroCounter {
    /// Segments absorbed into an aggregation, seeds included.
    Segments = 0,
    /// Segments whose sequence number did not continue the aggregate.
    UnexpectedSeq = 1,
    /// Segments lost to buffer exhaustion.
    DiscardedSegments = 2,
    /// Finalized aggregates.
    Aggregations = 3,
    /// Accumulator paired with `Aggregations`: segments across all aggregates.
    AggregatedSegments = 4,
    FlushRequests = 5,
    TimeoutFlushes = 6,
    TimerUnavailable = 7,
}

impl GroCounter {
    pub fn addr(self, stats_base: u64) -> u64 {
        stats_base.wrapping_add(self as u64 * 8)
    }
}

/// Point-in-time copy of a flow's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroStats {
    pub segments: u64,
    pub unexpected_seq: u64,
    pub discarded_segments: u64,
    pub aggregations: u64,
    pub aggregated_segments: u64,
    pub flush_requests: u64,
    pub timeout_flushes: u64,
    pub timer_unavailable: u64,
}

impl GroStats {
    pub fn read(bank: &CounterBank, stats_base: u64) -> GroStats {
        let get = |counter: GroCounter| bank.read(counter.addr(stats_base));
        GroStats {
            segments: get(GroCounter::Segments),
            unexpected_seq: get(GroCounter::UnexpectedSeq),
            discarded_segments: get(GroCounter::DiscardedSegments),
            aggregations: get(GroCounter::Aggregations),
            aggregated_segments: get(GroCounter::AggregatedSegments),
            flush_requests: get(GroCounter::FlushRequests),
            timeout_flushes: get(GroCounter::TimeoutFlushes),
            timer_unavailable: get(GroCounter::TimerUnavailable),
        }
    }
}
