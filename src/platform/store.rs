use crate::AggregationContext;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

type Record = Arc<Mutex<AggregationContext>>;

/// Default shard count of a [`ContextStore`].
pub const DEFAULT_STORE_SHARDS: usize = 64;

/// Key-addressed store of per-flow [`AggregationContext`] records.
///
/// Each address owns an exclusive lock. [`ContextStore::lock`] acquires it
/// and loads a working copy; the copy is written back only through
/// [`ContextGuard::commit`]. Records are created zero-initialised the first
/// time an address is used and are never removed by the engine.
pub struct ContextStore {
    shards: Box<[Mutex<HashMap<u64, Record>>]>,
}

impl Default for ContextStore {
    fn default() -> Self {
        ContextStore::new(DEFAULT_STORE_SHARDS)
    }
}

impl ContextStore {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ContextStore { shards }
    }

    fn record(&self, addr: u64) -> Record {
        // Fibonacci hashing keeps neighbouring addresses on different shards.
        let index = (addr.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize % self.shards.len();
        let mut shard = self.shards[index].lock();
        shard.entry(addr).or_default().clone()
    }

    /// Acquires the exclusive lock for `addr` and loads its record.
    ///
    /// Blocks while another caller holds the same address.
    pub fn lock(&self, addr: u64) -> ContextGuard {
        let record = Mutex::lock_arc(&self.record(addr));
        let working = record.clone();
        ContextGuard {
            addr,
            record,
            working,
        }
    }

    /// Copies the committed record for `addr` under its lock.
    pub fn snapshot(&self, addr: u64) -> AggregationContext {
        self.record(addr).lock().clone()
    }
}

/// Exclusive access to one context record.
///
/// Dropping the guard without [`commit`](ContextGuard::commit) releases the
/// lock and leaves the stored record untouched.
pub struct ContextGuard {
    addr: u64,
    record: ArcMutexGuard<RawMutex, AggregationContext>,
    working: AggregationContext,
}

impl ContextGuard {
    pub fn addr(&self) -> u64 {
        self.addr
    }
    /// Writes the working copy back and releases the lock.
    pub fn commit(mut self) {
        *self.record = std::mem::take(&mut self.working);
    }
    /// Releases the lock without writing anything back.
    pub fn abort(self) {}
}

impl Deref for ContextGuard {
    type Target = AggregationContext;
    fn deref(&self) -> &Self::Target {
        &self.working
    }
}

impl DerefMut for ContextGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.working
    }
}
