//! Per-gateway circuit breaker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use ipfetch_core::BreakerPolicy;
use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Attempts flow normally
    Closed = 0,
    /// Attempts go last until the open timeout passes
    Open = 1,
    /// One probe attempt at a time tests whether the gateway recovered
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

/// Failure detection for one gateway endpoint.
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    probe_in_flight: AtomicBool,
    /// When the breaker opened, or when the current probe started.
    opened_at: RwLock<Option<Instant>>,
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(policy: &BreakerPolicy) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            probe_in_flight: AtomicBool::new(false),
            opened_at: RwLock::new(None),
            failure_threshold: policy.failure_threshold.max(1),
            success_threshold: policy.success_threshold.max(1),
            open_timeout: Duration::from_millis(policy.open_timeout_ms),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Whether an attempt may go to this gateway now.
    ///
    /// Closed always allows. Once the open timeout has elapsed exactly one
    /// caller gets through as the probe and the breaker turns half-open; every
    /// other caller is refused until that probe reports back. A probe that
    /// never reports is given up on after another open timeout.
    pub fn is_allowed(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !self.timeout_elapsed() || !self.claim_probe() {
                    return false;
                }
                self.success_count.store(0, Ordering::SeqCst);
                self.state
                    .store(CircuitState::HalfOpen as u8, Ordering::SeqCst);
                true
            }
            CircuitState::HalfOpen => {
                if self.claim_probe() {
                    return true;
                }
                if self.timeout_elapsed() {
                    self.stamp();
                    return true;
                }
                false
            }
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);

        if self.state() == CircuitState::HalfOpen {
            let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.success_threshold {
                self.state
                    .store(CircuitState::Closed as u8, Ordering::SeqCst);
                self.success_count.store(0, Ordering::SeqCst);
            }
        }
        self.release_probe();
    }

    pub fn record_failure(&self) {
        self.success_count.store(0, Ordering::SeqCst);

        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        // A failed probe reopens immediately.
        if count >= self.failure_threshold || self.state() == CircuitState::HalfOpen {
            self.open();
        }
        self.release_probe();
    }

    /// Give the probe slot back without a verdict, e.g. when the attempt was
    /// cancelled.
    pub fn release_probe(&self) {
        self.probe_in_flight.store(false, Ordering::SeqCst);
    }

    fn claim_probe(&self) -> bool {
        let claimed = self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if claimed {
            self.stamp();
        }
        claimed
    }

    fn timeout_elapsed(&self) -> bool {
        self.opened_at
            .read()
            .ok()
            .and_then(|guard| *guard)
            .map(|at| at.elapsed() >= self.open_timeout)
            .unwrap_or(true)
    }

    fn stamp(&self) {
        if let Ok(mut guard) = self.opened_at.write() {
            *guard = Some(Instant::now());
        }
    }

    fn open(&self) {
        self.stamp();
        self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        self.probe_in_flight.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.opened_at.write() {
            *guard = None;
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_count", &self.failure_count.load(Ordering::Relaxed))
            .field("success_count", &self.success_count.load(Ordering::Relaxed))
            .finish()
    }
}
