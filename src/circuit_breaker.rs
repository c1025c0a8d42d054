//! Three-state circuit breaker with lock-free transitions.
//!
//! The breaker is split into a pre-request gate ([`CircuitBreaker::try_acquire`])
//! and completion hooks ([`record_success`](CircuitBreaker::record_success),
//! [`record_failure`](CircuitBreaker::record_failure),
//! [`abandon`](CircuitBreaker::abandon)), matching the interceptor shape of the
//! pipeline: the gate runs before the handler, the hooks after it returns.

use crate::clock::{Clock, MonotonicClock};
use crate::error::Rejection;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; failures are being counted.
    Closed,
    /// Requests are rejected until the recovery timeout elapses.
    Open,
    /// A bounded number of trial requests probe the downstream.
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerConfigError {
    /// Failure threshold must be > 0.
    #[error("failure_threshold must be > 0")]
    ZeroFailureThreshold,
    /// Recovery timeout must be > 0.
    #[error("recovery_timeout must be > 0")]
    ZeroRecoveryTimeout,
    /// Half-open probe limit must be > 0.
    #[error("half_open_max_probes must be > 0")]
    ZeroProbeLimit,
}

/// Validated breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    failure_threshold: usize,
    recovery_timeout: Duration,
    half_open_max_probes: usize,
}

impl BreakerConfig {
    /// Create a config, validating every field.
    pub fn new(
        failure_threshold: usize,
        recovery_timeout: Duration,
        half_open_max_probes: usize,
    ) -> Result<Self, BreakerConfigError> {
        if failure_threshold == 0 {
            return Err(BreakerConfigError::ZeroFailureThreshold);
        }
        if recovery_timeout == Duration::ZERO {
            return Err(BreakerConfigError::ZeroRecoveryTimeout);
        }
        if half_open_max_probes == 0 {
            return Err(BreakerConfigError::ZeroProbeLimit);
        }
        Ok(Self { failure_threshold, recovery_timeout, half_open_max_probes })
    }

    /// Consecutive failures before the circuit opens.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Time the circuit stays open before admitting trials.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Maximum concurrent trials while half-open.
    pub fn half_open_max_probes(&self) -> usize {
        self.half_open_max_probes
    }
}

#[derive(Debug)]
struct BreakerShared {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    probes_in_flight: AtomicUsize,
}

/// Circuit breaker guarding a downstream dependency.
///
/// Clones share the same underlying state via `Arc`, so every handle observes
/// and affects the same circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<BreakerShared>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker with a single half-open probe slot.
    ///
    /// # Examples
    /// ```
    /// use breakwater::CircuitBreaker;
    /// use std::time::Duration;
    /// let breaker = CircuitBreaker::new(5, Duration::from_secs(30)).unwrap();
    /// ```
    pub fn new(
        failure_threshold: usize,
        recovery_timeout: Duration,
    ) -> Result<Self, BreakerConfigError> {
        Ok(Self::with_config(BreakerConfig::new(failure_threshold, recovery_timeout, 1)?))
    }

    /// Create a breaker from a validated config.
    pub fn with_config(config: BreakerConfig) -> Self {
        Self {
            shared: Arc::new(BreakerShared {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                probes_in_flight: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_clock_arc(Arc::new(clock))
    }

    pub(crate) fn with_clock_arc(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Gate a request before it reaches the downstream.
    ///
    /// - **Closed**: admitted.
    /// - **Open**: rejected with the remaining recovery time, unless the
    ///   timeout has elapsed, in which case one caller wins the CAS into
    ///   half-open and is admitted as a trial.
    /// - **Half-open**: admitted while a probe slot is free, rejected
    ///   otherwise.
    ///
    /// Every admitted request must settle through exactly one of
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or [`abandon`](Self::abandon).
    pub fn try_acquire(&self) -> Result<(), Rejection> {
        loop {
            match CircuitState::from_u8(self.shared.state.load(Ordering::Acquire)) {
                CircuitState::Closed => return Ok(()),
                CircuitState::Open => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    let recovery = duration_to_millis(self.config.recovery_timeout);
                    if elapsed < recovery {
                        return Err(self.open_rejection(recovery - elapsed));
                    }
                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // CAS winner is the first trial.
                            self.shared.probes_in_flight.store(1, Ordering::Release);
                            tracing::info!("circuit half-open; admitting trial request");
                            return Ok(());
                        }
                        Err(STATE_CLOSED) => return Ok(()),
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    let probes = self.shared.probes_in_flight.fetch_add(1, Ordering::AcqRel);
                    if probes >= self.config.half_open_max_probes {
                        self.release_probe();
                        return Err(self.open_rejection(0));
                    }
                    tracing::debug!(
                        in_flight = probes + 1,
                        max = self.config.half_open_max_probes,
                        "circuit half-open; admitting additional trial"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Record a successful completion.
    ///
    /// Any success in the closed state resets the consecutive-failure count;
    /// a successful half-open trial closes the circuit.
    pub fn record_success(&self) {
        match CircuitState::from_u8(self.shared.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.failure_count.store(0, Ordering::Release);
                    self.shared.probes_in_flight.store(0, Ordering::Release);
                    self.shared.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("trial succeeded; circuit closed");
                } else {
                    self.release_probe();
                }
            }
            CircuitState::Closed => {
                self.shared.failure_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed completion (server-error class response or an
    /// unhandled handler error).
    pub fn record_failure(&self) {
        let failures = self.shared.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        match CircuitState::from_u8(self.shared.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.probes_in_flight.store(0, Ordering::Release);
                    self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "trial failed; circuit reopened");
                } else {
                    self.release_probe();
                }
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.probes_in_flight.store(0, Ordering::Release);
                    self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "failure threshold reached; circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Release an admitted request that short-circuited before exercising the
    /// downstream (cache hit, dedup replay, pool rejection).
    ///
    /// The request carries no verdict about downstream health, so no counter
    /// moves and no transition happens; only a held probe slot is returned.
    pub fn abandon(&self) {
        if CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
            == CircuitState::HalfOpen
        {
            self.release_probe();
        }
    }

    /// Current circuit state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Consecutive failures observed so far.
    pub fn failure_count(&self) -> usize {
        self.shared.failure_count.load(Ordering::Acquire)
    }

    /// Force the circuit back to closed, clearing all counters.
    pub fn reset(&self) {
        self.shared.state.store(STATE_CLOSED, Ordering::Release);
        self.shared.failure_count.store(0, Ordering::Release);
        self.shared.probes_in_flight.store(0, Ordering::Release);
        self.shared.opened_at_millis.store(0, Ordering::Release);
        tracing::info!("circuit reset to closed");
    }

    fn open_rejection(&self, retry_after_millis: u64) -> Rejection {
        Rejection::CircuitOpen {
            failure_count: self.shared.failure_count.load(Ordering::Acquire),
            retry_after: Duration::from_millis(retry_after_millis),
        }
    }

    fn release_probe(&self) {
        let _ = self.shared.probes_in_flight.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |probes| probes.checked_sub(1),
        );
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
