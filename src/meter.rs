use crate::sweeper;
use derive_more::Display;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A point in time rate/total snapshot of a meter.
#[derive(Debug, Display, Clone, Copy, PartialEq)]
#[display(fmt = "{} ({:.6}/s)", total, rate)]
pub struct Snapshot {
    /// The smoothed rate of the meter over a one second window.
    pub rate: f64,
    /// The running total of the meter.
    pub total: u64,
    /// The last time the total of the meter advanced.
    pub last_update: Instant,
}

/// A meter for monitoring a flow, counting events or bytes per second.
///
/// Producers feed the meter through [Meter::mark] on the hot path, which is a
/// single atomic add. The background sweeper recomputes the smoothed rate once
/// per second and stops tracking the meter when its rate decays below
/// [crate::IDLE_RATE]; a later mark resumes tracking and the running total is
/// carried across the idle period. Cloning the meter shares the underlying flow.
#[derive(Debug, Clone)]
pub struct Meter {
    pub(crate) inner: Arc<InnerMeter>,
}

impl Meter {
    pub fn new() -> Self {
        let now = sweeper::global().clock().now();
        Self {
            inner: Arc::new(InnerMeter {
                accumulator: AtomicU64::new(0),
                state: Mutex::new(MeterState {
                    registered: false,
                    snapshot: Snapshot {
                        rate: 0.0,
                        total: 0,
                        last_update: now,
                    },
                }),
            }),
        }
    }

    /// Add the given count to the meter total.
    ///
    /// Marking is lock-free. The mark which lifts the accumulator off zero
    /// additionally hands the meter to the sweeper, and may block briefly while
    /// the register channel is full.
    pub fn mark(&self, count: u64) {
        if count == 0 {
            return;
        }

        if self.inner.accumulator.fetch_add(count, Ordering::AcqRel) == 0 {
            // The accumulator came off zero, so the sweeper is most likely not
            // tracking this meter. If it still is, the sweep loop notices the
            // registered flag and drops the duplicate.
            sweeper::global().register(self.clone());
        }
    }

    /// Get a consistent snapshot of the current rate and total.
    pub fn snapshot(&self) -> Snapshot {
        let sweeper = sweeper::global();
        let _guard = sweeper.snapshot_read();
        self.inner.state.lock().snapshot
    }

    /// Set the accumulator, rate and total of the meter back to zero.
    ///
    /// Counts added by marks racing the reset may leave a small residue in the
    /// accumulator, which surfaces in the total again on the next sweep.
    pub fn reset(&self) {
        let sweeper = sweeper::global();
        let _guard = sweeper.snapshot_write();

        self.inner.accumulator.store(0, Ordering::Release);
        let mut state = self.inner.state.lock();
        state.snapshot.rate = 0.0;
        state.snapshot.total = 0;
        state.snapshot.last_update = sweeper.clock().now();
    }

    /// Check if the meter is currently on the active list of the sweeper.
    #[cfg(test)]
    pub(crate) fn is_registered(&self) -> bool {
        let sweeper = sweeper::global();
        let _guard = sweeper.snapshot_read();
        self.inner.state.lock().registered
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.snapshot())
    }
}

#[derive(Debug)]
pub(crate) struct InnerMeter {
    /// The live counter incremented by producers and harvested by the sweeper.
    pub(crate) accumulator: AtomicU64,
    /// The tracked state of the meter, off the hot path.
    /// Guarded by the global snapshot lock of the sweeper, the mutex itself
    /// only provides the interior mutability.
    pub(crate) state: Mutex<MeterState>,
}

#[derive(Debug)]
pub(crate) struct MeterState {
    /// Whether the meter is on the active list.
    /// Mutated only by the sweep loop under the global snapshot write lock.
    pub(crate) registered: bool,
    /// The stable values read by consumers.
    pub(crate) snapshot: Snapshot,
}
