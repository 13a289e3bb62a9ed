//! Continuous-refill token bucket rate limiter.
//!
//! Unlike a sliding-window counter, tokens accrue fractionally and
//! continuously: `tokens := min(capacity, tokens + elapsed * rate)`.
//! Waiters are released in the order they arrived, via a per-waiter
//! [`tokio::sync::Notify`] rather than a single broadcast notification, so
//! a burst of simultaneous acquirers cannot starve the one that has waited
//! longest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SleepOutcome};

struct TokenBucketState {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: crate::clock::Instant,
    waiters: VecDeque<(u64, Arc<Notify>)>,
}

impl TokenBucketState {
    fn refill(&mut self, now: crate::clock::Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// A rate limiter shared by all scheduler workers.
pub struct TokenBucket {
    state: parking_lot::Mutex<TokenBucketState>,
    next_ticket: AtomicU64,
}

impl TokenBucket {
    /// Construct a bucket starting full, with the given `capacity` (max
    /// burst) and `rate` (tokens added per second).
    pub fn new(capacity: f64, rate: f64, clock: &dyn Clock) -> Self {
        Self {
            state: parking_lot::Mutex::new(TokenBucketState {
                tokens: capacity,
                capacity,
                rate,
                last_refill: clock.now(),
                waiters: VecDeque::new(),
            }),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Take one token immediately if available, without waiting.
    pub fn try_acquire(&self, clock: &dyn Clock) -> bool {
        let mut state = self.state.lock();
        state.refill(clock.now());
        if state.tokens >= 1.0 && state.waiters.is_empty() {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current fractional token count, after refilling to `now`.
    pub fn available_tokens(&self, clock: &dyn Clock) -> f64 {
        let mut state = self.state.lock();
        state.refill(clock.now());
        state.tokens
    }

    /// Seconds until at least one token will be available, assuming no
    /// other acquirer intervenes.
    pub fn time_until_next_token(&self, clock: &dyn Clock) -> std::time::Duration {
        let mut state = self.state.lock();
        state.refill(clock.now());
        if state.tokens >= 1.0 {
            std::time::Duration::ZERO
        } else if state.rate <= 0.0 {
            std::time::Duration::MAX
        } else {
            std::time::Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
        }
    }

    /// Number of acquirers currently parked waiting for a token.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Change the refill rate going forward. Already-parked waiters are not
    /// re-ordered, only re-evaluated on their next wake attempt.
    pub fn set_rate(&self, rate: f64, clock: &dyn Clock) {
        let mut state = self.state.lock();
        state.refill(clock.now());
        state.rate = rate;
    }

    /// Change the maximum burst capacity.
    pub fn set_capacity(&self, capacity: f64, clock: &dyn Clock) {
        let mut state = self.state.lock();
        state.refill(clock.now());
        state.capacity = capacity;
        state.tokens = state.tokens.min(capacity);
    }

    /// Acquire one token, waiting in FIFO order if none is immediately
    /// available. Returns `false` if `cancel` fired before a token was
    /// granted.
    pub async fn acquire(&self, clock: &dyn Clock, cancel: &CancellationToken) -> bool {
        let ticket = self.next_ticket.fetch_add(1, AtomicOrdering::Relaxed);
        loop {
            let (wait, notify) = {
                let mut state = self.state.lock();
                state.refill(clock.now());
                let is_next = state
                    .waiters
                    .front()
                    .map(|(t, _)| *t == ticket)
                    .unwrap_or(true);
                if is_next && state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    if state.waiters.front().map(|(t, _)| *t == ticket).unwrap_or(false) {
                        state.waiters.pop_front();
                    }
                    return true;
                }
                let notify = if let Some((_, n)) = state.waiters.iter().find(|(t, _)| *t == ticket)
                {
                    n.clone()
                } else {
                    let n = Arc::new(Notify::new());
                    state.waiters.push_back((ticket, n.clone()));
                    n
                };
                let wait = self.time_until_next_token_locked(&mut state);
                (wait, notify)
            };
            let sleep_for = wait.max(std::time::Duration::from_millis(1));
            tokio::select! {
                _ = notify.notified() => {}
                outcome = clock.sleep(sleep_for, cancel) => {
                    if matches!(outcome, SleepOutcome::Cancelled) && cancel.is_cancelled() {
                        self.state.lock().waiters.retain(|(t, _)| *t != ticket);
                        return false;
                    }
                }
            }
        }
    }

    fn time_until_next_token_locked(&self, state: &mut TokenBucketState) -> std::time::Duration {
        if state.tokens >= 1.0 {
            std::time::Duration::ZERO
        } else if state.rate <= 0.0 {
            std::time::Duration::from_secs(1)
        } else {
            std::time::Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
        }
    }
}
