//! Three-state circuit breaker.
//!
//! CLOSED admits everything and counts consecutive failures. Tripping opens
//! the circuit for `open_duration`; once that elapses the next check moves to
//! HALF_OPEN, which admits a bounded number of probes. Probe success closes
//! the circuit; probe failure re-opens it with the open duration doubled, up
//! to five times the configured base. The exponential growth absorbs flapping
//! upstreams without locking callers out forever.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::error::ThrottleError;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// State changes surfaced to the orchestrator for event emission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerTransition {
    Opened {
        consecutive_failures: u32,
        retry_after: f64,
    },
    Closed,
}

/// The breaker itself. Not internally synchronized; the orchestrator owns it
/// behind its state lock.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_probes: u32,
    opened_at: Duration,
    current_open_duration: f64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let current_open_duration = config.open_duration;
        Self {
            config,
            clock,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_probes: 0,
            opened_at: Duration::ZERO,
            current_open_duration,
        }
    }

    /// Current state, after applying any due OPEN → HALF_OPEN transition.
    pub fn state(&mut self) -> BreakerState {
        self.maybe_half_open();
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Gate an admission. Fails with [`ThrottleError::CircuitOpen`] while
    /// open, and admits at most `half_open_max_calls` probes per half-open
    /// episode; overflow probes are rejected with `retry_after = 0`.
    pub fn check(&mut self) -> Result<(), ThrottleError> {
        self.maybe_half_open();

        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(ThrottleError::CircuitOpen {
                retry_after: self.retry_after(),
            }),
            BreakerState::HalfOpen => {
                if self.half_open_probes >= self.config.half_open_max_calls {
                    return Err(ThrottleError::CircuitOpen {
                        retry_after: self.retry_after(),
                    });
                }
                self.half_open_probes += 1;
                Ok(())
            }
        }
    }

    /// Record a success. Closes the circuit once enough half-open probes
    /// succeed.
    pub fn record_success(&mut self) -> Option<BreakerTransition> {
        self.consecutive_failures = 0;

        if self.state == BreakerState::HalfOpen {
            self.half_open_successes += 1;
            if self.half_open_successes >= self.config.half_open_max_calls {
                self.state = BreakerState::Closed;
                self.current_open_duration = self.config.open_duration;
                self.half_open_successes = 0;
                self.half_open_probes = 0;
                return Some(BreakerTransition::Closed);
            }
        }
        None
    }

    /// Record a failure. Opens the circuit when the consecutive threshold is
    /// reached, or re-opens with a doubled duration on a half-open probe
    /// failure.
    pub fn record_failure(&mut self) -> Option<BreakerTransition> {
        self.consecutive_failures += 1;

        match self.state {
            BreakerState::HalfOpen => {
                self.current_open_duration = (self.current_open_duration * 2.0)
                    .min(self.config.open_duration * 5.0);
                Some(self.open_circuit())
            }
            BreakerState::Closed
                if self.consecutive_failures >= self.config.consecutive_failures =>
            {
                Some(self.open_circuit())
            }
            BreakerState::Open if self.consecutive_failures >= self.config.consecutive_failures => {
                // Already open; refresh the window without re-announcing.
                self.opened_at = self.clock.now();
                None
            }
            _ => None,
        }
    }

    fn open_circuit(&mut self) -> BreakerTransition {
        self.state = BreakerState::Open;
        self.opened_at = self.clock.now();
        self.half_open_successes = 0;
        self.half_open_probes = 0;
        BreakerTransition::Opened {
            consecutive_failures: self.consecutive_failures,
            retry_after: self.current_open_duration,
        }
    }

    fn maybe_half_open(&mut self) {
        if self.state == BreakerState::Open {
            let elapsed = self.clock.now().saturating_sub(self.opened_at).as_secs_f64();
            if elapsed >= self.current_open_duration {
                self.state = BreakerState::HalfOpen;
                self.half_open_successes = 0;
                self.half_open_probes = 0;
            }
        }
    }

    fn retry_after(&self) -> f64 {
        let elapsed = self.clock.now().saturating_sub(self.opened_at).as_secs_f64();
        (self.current_open_duration - elapsed).max(0.0)
    }
}
