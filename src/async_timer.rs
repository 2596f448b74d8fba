use std::sync::Arc;
use std::time::Duration;

use crate::{CounterEngine, DeadlineTimers, FrameTransport, GroEngine, MetadataSink};
use ::tokio::task::JoinHandle;
use ::tokio::time::{self, Instant, MissedTickBehavior};

/// Spawns a tokio task that drives the engine's [`DeadlineTimers`] clock.
///
/// Every `tick` the clock is advanced by the wall time elapsed since the
/// task started and each expired timer is delivered to
/// [`GroEngine::timeout_callback`]. Abort the returned handle to stop it.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use gro_rs::{spawn_timer_driver, GroEngine};
///
/// #[tokio::main]
/// async fn main() {
///     let engine: Arc<GroEngine> = Arc::new(GroEngine::default());
///     let driver = spawn_timer_driver(engine.clone(), Duration::from_millis(1));
///     // ... feed segments through engine.aggregate_segment(...)
///     driver.abort();
/// }
/// ```
pub fn spawn_timer_driver<F, C, M>(
    engine: Arc<GroEngine<F, DeadlineTimers, C, M>>,
    tick: Duration,
) -> JoinHandle<()>
where
    F: FrameTransport + 'static,
    C: CounterEngine + 'static,
    M: MetadataSink + 'static,
{
    ::tokio::spawn(async move {
        let mut ticker = time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let start = Instant::now();
        let mut advanced_ms = 0u64;
        loop {
            ticker.tick().await;
            // Advance by whole milliseconds so sub-millisecond remainders carry over.
            let elapsed_ms = start.elapsed().as_millis() as u64;
            let events = engine.timers().advance_ms(elapsed_ms - advanced_ms);
            advanced_ms = elapsed_ms;
            for event in events {
                engine.timeout_callback(event);
            }
        }
    })
}
