use crate::clock::{Clock, SystemClock};
use crate::meter::Meter;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{trace, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::Ordering;
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The rate below which a meter is declared idle and dropped from the sweep
/// loop until it is marked again.
///
/// The default ensures that one event every ~30 seconds keeps a meter active.
pub const IDLE_RATE: f64 = 1e-13;

/// The cadence at which the sweeper recomputes meter snapshots.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The capacity of the channel carrying zero-to-positive accumulator
/// transitions from producers to the sweep loop.
const REGISTER_CHANNEL_CAPACITY: usize = 16;

/// The smoothing factor of the one second EWMA window.
static ALPHA: LazyLock<f64> = LazyLock::new(|| 1.0 - (-1.0f64).exp());

/// The process-wide sweeper instance.
static GLOBAL: LazyLock<RwLock<Arc<Sweeper>>> =
    LazyLock::new(|| RwLock::new(Sweeper::start(Arc::new(SystemClock))));

/// Get the current global sweeper.
pub(crate) fn global() -> Arc<Sweeper> {
    GLOBAL.read().clone()
}

/// Put a new clock in place for testing purposes only.
///
/// The current sweeper is stopped before a new one, driven by the given clock,
/// takes its place. Call this once before creating any meter and restore the
/// system clock with [restore_clock] afterwards; meters which are actively
/// tracked while the clocks are being swapped stop updating.
pub fn set_clock(clock: Arc<dyn Clock>) {
    replace_sweeper(clock);
}

/// Restore the system clock after a test, see [set_clock].
pub fn restore_clock() {
    replace_sweeper(Arc::new(SystemClock));
}

fn replace_sweeper(clock: Arc<dyn Clock>) {
    let mut sweeper = GLOBAL.write();
    sweeper.stop();
    *sweeper = Sweeper::start(clock);
}

/// The background engine which sweeps every active meter in the process.
///
/// It owns the register channel fed by [Meter::mark], the clock driving the
/// sweep cadence, and the global lock guarding all meter snapshots. The actual
/// sweeping is done by a dedicated worker thread running a [SweepLoop].
#[derive(Debug)]
pub(crate) struct Sweeper {
    clock: Arc<dyn Clock>,
    /// Guards the snapshot of every meter in the process.
    /// The sweep pass is a single critical section, so readers only ever
    /// contend with the once-per-second sweep.
    snapshot_lock: RwLock<()>,
    register_tx: Sender<Meter>,
    /// Dropped to signal the worker to exit.
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Start a new sweeper driven by the given clock.
    fn start(clock: Arc<dyn Clock>) -> Arc<Self> {
        let (register_tx, register_rx) = bounded(REGISTER_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = bounded(0);
        let sweeper = Arc::new(Self {
            clock,
            snapshot_lock: RwLock::new(()),
            register_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(None),
        });

        let loop_sweeper = sweeper.clone();
        match thread::Builder::new()
            .name("flow-sweeper".to_string())
            .spawn(move || SweepLoop::new(loop_sweeper, register_rx, stop_rx).run())
        {
            Ok(worker) => *sweeper.worker.lock() = Some(worker),
            Err(e) => warn!("Failed to spawn the flow sweeper worker, {}", e),
        }

        sweeper
    }

    /// Get the clock driving this sweeper.
    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Hand a meter to the sweep loop.
    /// This blocks briefly while the register channel is full.
    pub(crate) fn register(&self, meter: Meter) {
        if self.register_tx.send(meter).is_err() {
            warn!("Flow sweeper worker has stopped, the meter registration is dropped");
        }
    }

    /// Acquire the snapshot lock for reading.
    pub(crate) fn snapshot_read(&self) -> RwLockReadGuard<'_, ()> {
        self.snapshot_lock.read()
    }

    /// Acquire the snapshot lock for writing.
    pub(crate) fn snapshot_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.snapshot_lock.write()
    }

    /// Stop the sweep loop and wait for the worker to exit.
    fn stop(&self) {
        drop(self.stop_tx.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// The operation selected by one iteration of the active sweep loop.
enum SweepOp {
    /// A sweep tick, carrying the instant of the tick.
    Tick(Instant),
    /// A meter handed over by a producer.
    Register(Meter),
    /// The sweeper is being stopped.
    Stop,
}

/// The sweep loop state owned by the worker thread.
struct SweepLoop {
    sweeper: Arc<Sweeper>,
    register_rx: Receiver<Meter>,
    stop_rx: Receiver<()>,
    /// The meters currently being swept.
    /// The prefix `[..active]` has seen its registration tick, the remainder
    /// was appended since the previous tick.
    meters: Vec<Meter>,
    active: usize,
    last_update: Instant,
}

impl SweepLoop {
    fn new(sweeper: Arc<Sweeper>, register_rx: Receiver<Meter>, stop_rx: Receiver<()>) -> Self {
        let last_update = sweeper.clock.now();
        Self {
            sweeper,
            register_rx,
            stop_rx,
            meters: Vec::new(),
            active: 0,
            last_update,
        }
    }

    /// Run the sweep loop until the sweeper is stopped.
    /// The loop parks on the register channel while no meter is active.
    fn run(mut self) {
        trace!("Flow sweeper worker started");
        loop {
            let registration = select! {
                recv(self.register_rx) -> meter => meter.ok(),
                recv(self.stop_rx) -> _ => None,
            };

            match registration {
                Some(meter) => {
                    self.register(meter);
                    if !self.run_active() {
                        break;
                    }
                }
                None => break,
            }
        }
        trace!("Flow sweeper worker stopped");
    }

    /// Sweep while at least one meter is active.
    ///
    /// Returns `true` once the active list has drained and the loop should go
    /// back to parking on the register channel, `false` when the sweeper has
    /// been stopped.
    fn run_active(&mut self) -> bool {
        let ticker = self.sweeper.clock.ticker(SWEEP_INTERVAL);
        self.last_update = self.sweeper.clock.now();

        while !self.meters.is_empty() {
            let op = select! {
                recv(ticker.receiver()) -> tick => {
                    tick.map(SweepOp::Tick).unwrap_or(SweepOp::Stop)
                },
                recv(self.register_rx) -> meter => {
                    meter.map(SweepOp::Register).unwrap_or(SweepOp::Stop)
                },
                recv(self.stop_rx) -> _ => SweepOp::Stop,
            };

            match op {
                SweepOp::Tick(now) => self.update(now),
                SweepOp::Register(meter) => self.register(meter),
                SweepOp::Stop => return false,
            }
        }

        trace!("Flow sweeper active list drained, parking until the next registration");
        self.meters = Vec::new();
        self.active = 0;
        true
    }

    /// Add the meter to the active list if it isn't being tracked yet.
    fn register(&mut self, meter: Meter) {
        {
            let _guard = self.sweeper.snapshot_lock.write();
            let mut state = meter.inner.state.lock();
            if state.registered {
                // registered twice, move on
                return;
            }
            state.registered = true;
        }

        self.meters.push(meter);
    }

    /// Process a single tick for all meters on the active list.
    fn update(&mut self, now: Instant) {
        // pick up registrations which arrived ahead of this tick, their
        // registration pass must not be delayed by the selection order
        while let Ok(meter) = self.register_rx.try_recv() {
            self.register(meter);
        }

        let _guard = self.sweeper.snapshot_lock.write();

        let tdiff = now.saturating_duration_since(self.last_update);
        if tdiff.is_zero() {
            // the clock stalled or went backwards, skip this tick
            return;
        }
        self.last_update = now;
        let time_multiplier = 1.0 / tdiff.as_secs_f64();

        for meter in &self.meters[..self.active] {
            let total = meter.inner.accumulator.load(Ordering::Acquire);
            let mut state = meter.inner.state.lock();
            let snapshot = &mut state.snapshot;
            let diff = total.wrapping_sub(snapshot.total);
            let instant = time_multiplier * diff as f64;

            if diff > 0 {
                snapshot.last_update = now;
            }

            if snapshot.rate == 0.0 {
                snapshot.rate = instant;
            } else {
                snapshot.rate += *ALPHA * (instant - snapshot.rate);
            }
            snapshot.total = total;

            if snapshot.rate > IDLE_RATE {
                continue;
            }

            // the meter looks idle, zero the accumulator to stop tracking it
            let swapped = meter.inner.accumulator.swap(0, Ordering::AcqRel);
            if swapped > total {
                // a mark raced the swap, put back what was taken
                let current = meter
                    .inner
                    .accumulator
                    .fetch_add(swapped, Ordering::AcqRel)
                    .wrapping_add(swapped);
                if current == swapped {
                    // every racing mark landed before the swap and nobody observed
                    // the zeroed accumulator, the meter has to stay tracked
                    continue;
                }
                // a producer observed the zero and enqueued a registration.
                // Leave only the delta since the snapshot behind, the tick after
                // the re-registration restores the running total.
                meter
                    .inner
                    .accumulator
                    .fetch_sub(snapshot.total, Ordering::AcqRel);
            }

            snapshot.rate = 0.0;
            state.registered = false;
        }

        // Restore the running total of the meters registered since the previous
        // tick. Doing this here instead of on registration keeps the register
        // path down to setting the registered flag, and skipping their rate
        // update makes the first sample span a full sweep interval.
        for meter in &self.meters[self.active..] {
            let mut state = meter.inner.state.lock();
            let total = meter
                .inner
                .accumulator
                .fetch_add(state.snapshot.total, Ordering::AcqRel)
                .wrapping_add(state.snapshot.total);
            if total > state.snapshot.total {
                state.snapshot.last_update = now;
            }
            state.snapshot.total = total;
        }

        // compact the list and trim the allocation after a burst
        self.meters.retain(|meter| meter.inner.state.lock().registered);
        if self.meters.len() * 2 < self.meters.capacity() {
            self.meters.shrink_to_fit();
        }
        self.active = self.meters.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::init_logger;
    use crate::registry::MeterRegistry;
    use crate::tests::{with_manual_clock, yield_to_sweeper};
    use std::sync::Barrier;

    #[test]
    fn test_shared_meter() {
        init_logger!();

        with_manual_clock(|clock| {
            let meter = Meter::new();
            let barrier = Arc::new(Barrier::new(21));
            let producers: Vec<_> = (0..20)
                .map(|_| {
                    let meter = meter.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        for _ in 0..300 {
                            meter.mark(50);
                            barrier.wait();
                            barrier.wait();
                        }
                        for _ in 0..300 {
                            meter.mark(10);
                            barrier.wait();
                            barrier.wait();
                        }
                    })
                })
                .collect();

            for _ in 0..300 {
                barrier.wait();
                clock.advance(Duration::from_millis(40));
                barrier.wait();
            }
            let rate = meter.snapshot().rate;
            assert!(
                (rate - 25000.0).abs() < 100.0,
                "expected rate 25000 (±100), got {}",
                rate
            );

            for _ in 0..300 {
                barrier.wait();
                clock.advance(Duration::from_millis(40));
                barrier.wait();
            }
            let rate = meter.snapshot().rate;
            assert!(
                (rate - 5000.0).abs() < 20.0,
                "expected rate 5000 (±20), got {}",
                rate
            );

            for producer in producers {
                producer.join().unwrap();
            }

            clock.advance(Duration::from_secs(2));
            assert_eq!(
                360000,
                meter.snapshot().total,
                "expected every mark of every producer to be accounted for"
            );
        });
    }

    #[test]
    fn test_meter_idle_and_reactivation() {
        init_logger!();

        with_manual_clock(|clock| {
            let meter = Meter::new();

            for _ in 0..40 {
                meter.mark(1);
                clock.advance(Duration::from_millis(100));
            }
            let rate = meter.snapshot().rate;
            assert!(
                (rate - 10.0).abs() < 1.0,
                "expected rate 10 (±1), got {}",
                rate
            );

            // decay the rate below the idle threshold
            clock.advance(Duration::from_secs(62));
            assert_eq!(
                0,
                meter.inner.accumulator.load(Ordering::Acquire),
                "expected the meter to be paused"
            );
            assert_eq!(
                false,
                meter.is_registered(),
                "expected the meter to be off the active list"
            );
            assert_eq!(
                40,
                meter.snapshot().total,
                "expected the total to survive the idle transition"
            );

            for _ in 0..40 {
                meter.mark(2);
                clock.advance(Duration::from_millis(100));
            }
            let rate = meter.snapshot().rate;
            assert!(
                (rate - 20.0).abs() < 4.0,
                "expected rate 20 (±4), got {}",
                rate
            );

            clock.advance(Duration::from_secs(2));
            assert_eq!(
                120,
                meter.snapshot().total,
                "expected no mark to be lost across the idle cycle"
            );
            assert_ne!(
                0,
                meter.inner.accumulator.load(Ordering::Acquire),
                "expected the meter to be active"
            );
        });
    }

    #[test]
    fn test_idle_inconsistency() {
        init_logger!();

        with_manual_clock(|clock| {
            let registry = MeterRegistry::new();
            let first = registry.get("first");
            let second = registry.get("second");
            let third = registry.get("third");

            first.mark(10);
            second.mark(20);
            third.mark(30);

            // make the first and third meter go idle
            for _ in 0..30 {
                clock.advance(Duration::from_secs(1));
                second.mark(1);
            }

            clock.advance(Duration::from_secs(1));

            // re-activate the third meter
            third.mark(20);
            clock.advance(Duration::from_secs(1));

            assert_eq!(
                10,
                registry.get("first").snapshot().total,
                "expected the total of the idle meter to be preserved"
            );
            assert_eq!(
                50,
                registry.get("second").snapshot().total,
                "expected the total of the active meter to keep advancing"
            );
            assert_eq!(
                50,
                registry.get("third").snapshot().total,
                "expected the re-activated meter to resume from its preserved total"
            );
        });
    }

    #[test]
    fn test_sweeper_drain_and_repark() {
        init_logger!();

        with_manual_clock(|clock| {
            let meter = Meter::new();

            meter.mark(5);
            yield_to_sweeper();
            clock.advance(Duration::from_secs(3));
            assert_eq!(
                false,
                meter.is_registered(),
                "expected the drained meter to be off the active list"
            );
            assert_eq!(5, meter.snapshot().total);

            // the parked sweeper should pick the meter up again
            meter.mark(5);
            yield_to_sweeper();
            clock.advance(Duration::from_secs(3));
            assert_eq!(10, meter.snapshot().total);
        });
    }
}
