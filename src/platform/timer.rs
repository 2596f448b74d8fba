use crate::{GroError, TimeoutFlush};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identifies one arming of a timer slot.
///
/// The generation changes whenever the slot is released, so a handle held
/// past `delete_timer`/`ack_fired` never matches a later arming of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pool: u16,
    slot: u32,
    generation: u32,
}

/// Tick size a timer duration is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerGranularity {
    #[default]
    Millis1,
    Millis10,
    Millis100,
    Seconds1,
}

impl TimerGranularity {
    pub fn as_millis(self) -> u64 {
        match self {
            TimerGranularity::Millis1 => 1,
            TimerGranularity::Millis10 => 10,
            TimerGranularity::Millis100 => 100,
            TimerGranularity::Seconds1 => 1000,
        }
    }
}

/// User callback invoked after a timeout flush.
pub type FlushCallback = Arc<dyn Fn(TimeoutFlush) + Send + Sync>;

/// Completion target registered with a timer: callback plus opaque argument.
#[derive(Clone)]
pub struct Completion {
    pub(crate) callback: FlushCallback,
    pub(crate) arg: u64,
}

impl Completion {
    pub fn new<F>(callback: F, arg: u64) -> Self
    where
        F: Fn(TimeoutFlush) + Send + Sync + 'static,
    {
        Completion {
            callback: Arc::new(callback),
            arg,
        }
    }
    pub fn arg(&self) -> u64 {
        self.arg
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("arg", &self.arg).finish()
    }
}

/// Arguments of [`TimerService::create_timer`].
#[derive(Debug, Clone)]
pub struct TimerRequest {
    pub pool_id: u16,
    pub duration: u16,
    pub granularity: TimerGranularity,
    /// Opaque value returned in the fired event, the context address.
    pub context_addr: u64,
    pub completion: Option<Completion>,
}

/// A timer expiry delivered back to the engine.
#[derive(Debug, Clone)]
pub struct TimerEvent {
    pub handle: TimerHandle,
    pub context_addr: u64,
    pub completion: Option<Completion>,
}

/// One-shot deadline timers bound to an opaque 64-bit context value.
pub trait TimerService: Send + Sync {
    /// Arms a new one-shot timer, failing when the pool has no free slot.
    fn create_timer(&self, request: TimerRequest) -> Result<TimerHandle, GroError>;
    /// Cancels an armed timer or releases a fired one. Stale handles are ignored.
    fn delete_timer(&self, handle: TimerHandle);
    /// Restarts an armed timer with its original duration.
    fn recharge_timer(&self, handle: TimerHandle) -> Result<(), GroError>;
    /// Acknowledges that a fired event has been processed and frees its slot.
    fn ack_fired(&self, handle: TimerHandle);
}

enum SlotState {
    Free,
    Armed {
        deadline_ms: u64,
        duration_ms: u64,
        context_addr: u64,
        completion: Option<Completion>,
    },
    Fired,
}

struct Slot {
    generation: u32,
    state: SlotState,
}

struct TimerPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl TimerPool {
    fn new(capacity: u32) -> Self {
        TimerPool {
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: 0,
                    state: SlotState::Free,
                })
                .collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    fn owned(&mut self, handle: TimerHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
            .filter(|slot| !matches!(slot.state, SlotState::Free))
    }

    fn release(&mut self, handle: TimerHandle) {
        if let Some(slot) = self.owned(handle) {
            slot.state = SlotState::Free;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(handle.slot);
        }
    }
}

struct TimerTable {
    now_ms: u64,
    pools: HashMap<u16, TimerPool>,
}

/// Default slot count of the pool registered by `DeadlineTimers::default()`.
pub const DEFAULT_TIMER_SLOTS: u32 = 1024;

/// In-memory [`TimerService`] driven by an explicit millisecond clock.
///
/// Nothing fires on its own: [`DeadlineTimers::advance`] moves the clock
/// and returns the events that expired, which the owner delivers to
/// [`GroEngine::timeout_callback`](crate::GroEngine::timeout_callback).
/// With the `async_tokio` feature, [`spawn_timer_driver`](crate::spawn_timer_driver)
/// does this on a tokio interval.
pub struct DeadlineTimers {
    inner: Mutex<TimerTable>,
}

impl Default for DeadlineTimers {
    fn default() -> Self {
        DeadlineTimers::new().with_pool(0, DEFAULT_TIMER_SLOTS)
    }
}

impl DeadlineTimers {
    /// Creates a timer service with no pools registered.
    pub fn new() -> Self {
        DeadlineTimers {
            inner: Mutex::new(TimerTable {
                now_ms: 0,
                pools: HashMap::new(),
            }),
        }
    }
    /// Registers (or replaces) pool `pool_id` with `capacity` slots.
    pub fn with_pool(self, pool_id: u16, capacity: u32) -> Self {
        self.add_pool(pool_id, capacity);
        self
    }
    pub fn add_pool(&self, pool_id: u16, capacity: u32) {
        self.inner
            .lock()
            .pools
            .insert(pool_id, TimerPool::new(capacity));
    }
    pub fn now_ms(&self) -> u64 {
        self.inner.lock().now_ms
    }
    /// Number of armed or fired-but-unacknowledged timers in `pool_id`.
    pub fn in_use(&self, pool_id: u16) -> usize {
        let table = self.inner.lock();
        table
            .pools
            .get(&pool_id)
            .map(|pool| pool.slots.len() - pool.free.len())
            .unwrap_or(0)
    }
    /// Whether `handle` still names an armed timer.
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        let mut table = self.inner.lock();
        table
            .pools
            .get_mut(&handle.pool)
            .and_then(|pool| pool.owned(handle))
            .map(|slot| matches!(slot.state, SlotState::Armed { .. }))
            .unwrap_or(false)
    }

    pub fn advance(&self, elapsed: Duration) -> Vec<TimerEvent> {
        self.advance_ms(elapsed.as_millis() as u64)
    }

    /// Moves the clock forward and fires every timer whose deadline passed,
    /// earliest first. Fired slots stay allocated until [`TimerService::ack_fired`].
    pub fn advance_ms(&self, elapsed_ms: u64) -> Vec<TimerEvent> {
        let mut table = self.inner.lock();
        table.now_ms = table.now_ms.saturating_add(elapsed_ms);
        let now_ms = table.now_ms;
        let mut expired = Vec::new();
        for (&pool_id, pool) in table.pools.iter_mut() {
            for (index, slot) in pool.slots.iter_mut().enumerate() {
                let due = matches!(slot.state, SlotState::Armed { deadline_ms, .. } if deadline_ms <= now_ms);
                if !due {
                    continue;
                }
                if let SlotState::Armed {
                    deadline_ms,
                    context_addr,
                    completion,
                    ..
                } = std::mem::replace(&mut slot.state, SlotState::Fired)
                {
                    let handle = TimerHandle {
                        pool: pool_id,
                        slot: index as u32,
                        generation: slot.generation,
                    };
                    expired.push((
                        deadline_ms,
                        TimerEvent {
                            handle,
                            context_addr,
                            completion,
                        },
                    ));
                }
            }
        }
        expired.sort_by_key(|(deadline_ms, _)| *deadline_ms);
        expired.into_iter().map(|(_, event)| event).collect()
    }
}

impl TimerService for DeadlineTimers {
    fn create_timer(&self, request: TimerRequest) -> Result<TimerHandle, GroError> {
        let mut table = self.inner.lock();
        let now_ms = table.now_ms;
        let pool = table
            .pools
            .get_mut(&request.pool_id)
            .ok_or(GroError::UnknownTimerPool(request.pool_id))?;
        let index = pool.free.pop().ok_or(GroError::TimerExhausted {
            pool: request.pool_id,
        })?;
        let slot = &mut pool.slots[index as usize];
        let duration_ms = request.duration as u64 * request.granularity.as_millis();
        slot.state = SlotState::Armed {
            deadline_ms: now_ms + duration_ms,
            duration_ms,
            context_addr: request.context_addr,
            completion: request.completion,
        };
        Ok(TimerHandle {
            pool: request.pool_id,
            slot: index,
            generation: slot.generation,
        })
    }

    fn delete_timer(&self, handle: TimerHandle) {
        let mut table = self.inner.lock();
        if let Some(pool) = table.pools.get_mut(&handle.pool) {
            pool.release(handle);
        }
    }

    fn recharge_timer(&self, handle: TimerHandle) -> Result<(), GroError> {
        let mut table = self.inner.lock();
        let now_ms = table.now_ms;
        let slot = table
            .pools
            .get_mut(&handle.pool)
            .and_then(|pool| pool.owned(handle))
            .ok_or(GroError::TimerNotOwned)?;
        match &mut slot.state {
            SlotState::Armed {
                deadline_ms,
                duration_ms,
                ..
            } => {
                *deadline_ms = now_ms + *duration_ms;
                Ok(())
            }
            _ => Err(GroError::TimerNotOwned),
        }
    }

    fn ack_fired(&self, handle: TimerHandle) {
        let mut table = self.inner.lock();
        if let Some(pool) = table.pools.get_mut(&handle.pool) {
            let fired = pool
                .owned(handle)
                .map(|slot| matches!(slot.state, SlotState::Fired))
                .unwrap_or(false);
            if fired {
                pool.release(handle);
            }
        }
    }
}
