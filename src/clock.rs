//! Time as an injected capability.
//!
//! Every timing decision in this crate — token bucket refill, ramp-up and
//! cooldown ticks, retry backoff, pause/resume waits — reads the current
//! instant and sleeps exclusively through [`Clock`]. Production code uses
//! [`SystemClock`]; tests use [`VirtualClock`], which advances only when
//! told to, so many independent scheduler instances can run the same
//! scenario in parallel without racing a shared, process-global timer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A monotonic instant local to a particular [`Clock`]. Not comparable
/// across clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

impl Instant {
    /// Nanoseconds since the clock's epoch (construction or zero).
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Duration elapsed between an earlier instant and `self`. Saturates to
    /// zero if `earlier` is after `self`.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// `self + dur`, saturating at `u64::MAX` nanoseconds.
    pub fn saturating_add(&self, dur: Duration) -> Instant {
        Instant(self.0.saturating_add(dur.as_nanos() as u64))
    }
}

/// Outcome of a [`Clock::sleep`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The requested duration elapsed.
    Elapsed,
    /// The supplied [`CancellationToken`] fired before the duration elapsed.
    Cancelled,
}

/// A source of monotonic time and cancellable delay.
///
/// Implementors must be cheap to clone (typically an `Arc` wrapper) since a
/// `Clock` handle is threaded through every scheduler component.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// The current instant, monotonic for the lifetime of this clock.
    fn now(&self) -> Instant;

    /// Sleep until `dur` has elapsed or `cancel` fires, whichever comes
    /// first.
    async fn sleep(&self, dur: Duration, cancel: &CancellationToken) -> SleepOutcome;
}

/// Real-time clock backed by `tokio::time`.
#[derive(Debug, Clone, Default)]
pub struct SystemClock {
    epoch: tokio::time::Instant,
}

impl SystemClock {
    /// Construct a new system clock with its epoch at the current instant.
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }
}

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant(self.epoch.elapsed().as_nanos() as u64)
    }

    async fn sleep(&self, dur: Duration, cancel: &CancellationToken) -> SleepOutcome {
        tokio::select! {
            _ = tokio::time::sleep(dur) => SleepOutcome::Elapsed,
            _ = cancel.cancelled() => SleepOutcome::Cancelled,
        }
    }
}

struct Waiter {
    deadline: u64,
    sequence: u64,
    notify: Arc<Notify>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on (deadline, sequence): reverse the natural order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct VirtualClockState {
    now: u64,
    next_sequence: u64,
    waiters: BinaryHeap<Waiter>,
}

/// A manually-advanced clock for deterministic tests.
///
/// `advance` wakes every waiter whose deadline has passed, in
/// `(deadline, registration order)` order, mirroring the FIFO waiter
/// semantics the token bucket and agent caps components rely on elsewhere
/// in the crate.
#[derive(Clone)]
pub struct VirtualClock {
    state: Arc<parking_lot::Mutex<VirtualClockState>>,
    sequence_counter: Arc<AtomicU64>,
}

impl VirtualClock {
    /// Construct a virtual clock starting at instant zero.
    pub fn new() -> Self {
        Self {
            state: Arc::new(parking_lot::Mutex::new(VirtualClockState {
                now: 0,
                next_sequence: 0,
                waiters: BinaryHeap::new(),
            })),
            sequence_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Advance the clock by `dur`, waking any waiter whose deadline has now
    /// passed.
    pub fn advance(&self, dur: Duration) {
        let mut to_wake = Vec::new();
        {
            let mut state = self.state.lock();
            state.now = state.now.saturating_add(dur.as_nanos() as u64);
            while let Some(top) = state.waiters.peek() {
                if top.deadline <= state.now {
                    to_wake.push(state.waiters.pop().unwrap());
                } else {
                    break;
                }
            }
        }
        for waiter in to_wake {
            waiter.notify.notify_one();
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        Instant(self.state.lock().now)
    }

    async fn sleep(&self, dur: Duration, cancel: &CancellationToken) -> SleepOutcome {
        let notify = Arc::new(Notify::new());
        let deadline = {
            let mut state = self.state.lock();
            let deadline = state.now.saturating_add(dur.as_nanos() as u64);
            if deadline <= state.now {
                return SleepOutcome::Elapsed;
            }
            let sequence = self.sequence_counter.fetch_add(1, AtomicOrdering::Relaxed);
            state.waiters.push(Waiter {
                deadline,
                sequence,
                notify: notify.clone(),
            });
            deadline
        };
        tokio::select! {
            _ = notify.notified() => {
                // Spurious wake guard: only report Elapsed once time has
                // actually reached the deadline we registered for.
                if self.state.lock().now >= deadline {
                    SleepOutcome::Elapsed
                } else {
                    SleepOutcome::Cancelled
                }
            }
            _ = cancel.cancelled() => SleepOutcome::Cancelled,
        }
    }
}
