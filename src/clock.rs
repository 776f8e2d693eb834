use crossbeam_channel::{bounded, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A trait representing the monotonic time source of the flow sweeper.
///
/// Types implementing this trait supply two primitives:
///
/// * **`now`** returns the current instant of the clock
/// * **`ticker`** creates a stream of instants delivered at a fixed cadence
///
/// The sweeper never reads wall-clock time. [SystemClock] backs the trait with
/// the OS monotonic clock, while [ManualClock] only moves when it is advanced
/// explicitly, which makes time-dependent behavior fully deterministic in tests.
pub trait Clock: Debug + Send + Sync {
    /// Get the current instant of the clock.
    fn now(&self) -> Instant;

    /// Create a new ticker which delivers an instant for every elapsed period.
    fn ticker(&self, period: Duration) -> Ticker;
}

/// A periodic tick stream handed out by a [Clock].
///
/// Every delivered instant carries the time of the tick itself.
/// Dropping the ticker stops the underlying stream.
#[derive(Debug)]
pub struct Ticker {
    receiver: Receiver<Instant>,
}

impl Ticker {
    /// Create a new ticker around the given tick channel.
    pub fn new(receiver: Receiver<Instant>) -> Self {
        Self { receiver }
    }

    /// Get the channel on which the ticks are delivered.
    pub fn receiver(&self) -> &Receiver<Instant> {
        &self.receiver
    }
}

/// The [Clock] implementation backed by the OS monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn ticker(&self, period: Duration) -> Ticker {
        Ticker::new(tick(period))
    }
}

/// A manually advanced [Clock] for deterministic tests.
///
/// Time stands still until [ManualClock::advance] is called. While the clock
/// advances, every crossed ticker deadline fires in chronological order and
/// [Clock::now] reflects the deadline being fired, so a consumer processing
/// the stream observes the same intermediate instants a live clock would have
/// produced. Cloning the handle shares the underlying clock.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<InnerManualClock>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InnerManualClock {
                state: Mutex::new(ManualClockState {
                    now: Instant::now(),
                    tickers: Vec::new(),
                }),
            }),
        }
    }

    /// Move the clock forward by the given duration.
    ///
    /// Tickers fire synchronously on the way: the handoff of a tick blocks
    /// until the receiving side has accepted it, and tickers whose receiver
    /// has been dropped are discarded. The call returns once the clock has
    /// reached the target instant.
    pub fn advance(&self, duration: Duration) {
        let target = self.inner.state.lock().now + duration;

        loop {
            let (sender, at) = {
                let mut state = self.inner.state.lock();
                match state.next_deadline(target) {
                    Some(index) => {
                        let ticker = &mut state.tickers[index];
                        let at = ticker.deadline;
                        let sender = ticker.sender.clone();
                        ticker.deadline = at + ticker.period;
                        state.now = at;
                        (sender, at)
                    }
                    None => {
                        state.now = target;
                        break;
                    }
                }
            };

            // deliver outside of the state lock, the receiver may call back into the clock
            if sender.send(at).is_err() {
                self.inner
                    .state
                    .lock()
                    .tickers
                    .retain(|e| !e.sender.same_channel(&sender));
            }
        }

        // give the receiving side a moment to process before time moves on
        thread::sleep(Duration::from_millis(1));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.state.lock().now
    }

    fn ticker(&self, period: Duration) -> Ticker {
        debug_assert!(!period.is_zero(), "ticker period cannot be zero");
        let (sender, receiver) = bounded(0);
        let mut state = self.inner.state.lock();
        let deadline = state.now + period;

        state.tickers.push(ManualTicker {
            period,
            deadline,
            sender,
        });
        Ticker::new(receiver)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct InnerManualClock {
    state: Mutex<ManualClockState>,
}

#[derive(Debug)]
struct ManualClockState {
    now: Instant,
    tickers: Vec<ManualTicker>,
}

impl ManualClockState {
    /// Find the ticker with the earliest deadline within the target instant.
    fn next_deadline(&self, target: Instant) -> Option<usize> {
        self.tickers
            .iter()
            .enumerate()
            .filter(|(_, e)| e.deadline <= target)
            .min_by_key(|(_, e)| e.deadline)
            .map(|(index, _)| index)
    }
}

#[derive(Debug)]
struct ManualTicker {
    period: Duration,
    deadline: Instant,
    sender: Sender<Instant>,
}
