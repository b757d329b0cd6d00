//! Per-target circuit breaker.
//!
//! closed -> open after `failure_threshold` consecutive failures; open until
//! `open_until_ms`; then half-open, where exactly one trial is admitted. A
//! successful trial closes the breaker, a failed one re-opens it.
//!
//! Callers hold a [`BreakerAttempt`] for the duration of a call. An attempt
//! dropped without an outcome (cancelled future, aborted task) hands the
//! trial slot back.

use crate::time::Clock;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl BreakerPolicy {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_duration,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: AtomicU32,
    /// Zero while closed.
    open_until_ms: AtomicI64,
    half_open_in_flight: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker<K, C>
where
    K: Eq + Hash + Clone,
    C: Clock,
{
    clock: C,
    states: DashMap<K, Arc<BreakerState>>,
}

impl<K, C> CircuitBreaker<K, C>
where
    K: Eq + Hash + Clone,
    C: Clock,
{
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            states: DashMap::new(),
        }
    }

    fn state(&self, target: &K) -> Arc<BreakerState> {
        if let Some(state) = self.states.get(target) {
            return state.clone();
        }
        self.states.entry(target.clone()).or_default().clone()
    }

    /// Whether a call may proceed. In half-open this claims the single trial slot.
    pub fn try_begin(&self, target: &K) -> bool {
        let state = self.state(target);
        let open_until = state.open_until_ms.load(Ordering::Acquire);
        if open_until <= 0 {
            return true;
        }
        if self.clock.unix_millis() < open_until {
            return false;
        }
        state
            .half_open_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim a call slot; the returned guard settles it.
    pub fn begin(&self, target: &K) -> Option<BreakerAttempt<'_, K, C>> {
        if !self.try_begin(target) {
            return None;
        }
        Some(BreakerAttempt {
            breaker: self,
            target: target.clone(),
            settled: false,
        })
    }

    pub fn on_success(&self, target: &K) {
        let state = self.state(target);
        state.consecutive_failures.store(0, Ordering::Release);
        state.open_until_ms.store(0, Ordering::Release);
        state.half_open_in_flight.store(false, Ordering::Release);
    }

    /// Count a failure; returns true when this failure opened (or re-opened) the breaker.
    pub fn on_failure(&self, target: &K, policy: BreakerPolicy) -> bool {
        let state = self.state(target);
        let failures = state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let opened = failures >= policy.failure_threshold.max(1);
        if opened {
            let until = self.clock.unix_millis() + policy.open_duration.as_millis() as i64;
            // A zero open duration still needs a non-zero marker to enter half-open.
            state.open_until_ms.store(until.max(1), Ordering::Release);
        }
        state.half_open_in_flight.store(false, Ordering::Release);
        opened
    }

    /// Release the half-open trial slot regardless of outcome.
    pub fn end_attempt(&self, target: &K) {
        if let Some(state) = self.states.get(target) {
            state.half_open_in_flight.store(false, Ordering::Release);
        }
    }

    pub fn phase(&self, target: &K) -> BreakerPhase {
        let Some(state) = self.states.get(target) else {
            return BreakerPhase::Closed;
        };
        let open_until = state.open_until_ms.load(Ordering::Acquire);
        if open_until <= 0 {
            BreakerPhase::Closed
        } else if self.clock.unix_millis() < open_until {
            BreakerPhase::Open
        } else {
            BreakerPhase::HalfOpen
        }
    }
}

/// One admitted call. Settle with [`succeed`](Self::succeed) or
/// [`fail`](Self::fail); dropping it unsettled only releases the trial slot.
pub struct BreakerAttempt<'a, K, C>
where
    K: Eq + Hash + Clone,
    C: Clock,
{
    breaker: &'a CircuitBreaker<K, C>,
    target: K,
    settled: bool,
}

impl<K, C> BreakerAttempt<'_, K, C>
where
    K: Eq + Hash + Clone,
    C: Clock,
{
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(&self.target);
    }

    /// Returns true when this failure opened the breaker.
    pub fn fail(mut self, policy: BreakerPolicy) -> bool {
        self.settled = true;
        self.breaker.on_failure(&self.target, policy)
    }
}

impl<K, C> Drop for BreakerAttempt<'_, K, C>
where
    K: Eq + Hash + Clone,
    C: Clock,
{
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.end_attempt(&self.target);
        }
    }
}
