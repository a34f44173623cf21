//! Injected time and randomness capabilities.
//!
//! Every component that reads the clock or draws randomness does so through
//! the two small traits defined here, handed in as `Arc<dyn _>` at
//! construction. Nothing reaches for global state, which is what makes the
//! whole engine deterministic under test: swap in [`ManualClock`] and
//! [`FixedRandom`] and every timing decision becomes a pure function of the
//! call sequence.
//!
//! The default [`MonotonicClock`] is anchored on [`tokio::time::Instant`]
//! rather than `std::time::Instant`, so clock reads stay coherent with
//! `tokio::time::sleep` when a test pauses and auto-advances the runtime
//! clock (`#[tokio::test(start_paused = true)]`).

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

/// Monotonic time source.
///
/// `now()` returns the time elapsed since an arbitrary fixed origin chosen at
/// construction. Readings never decrease.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Uniform randomness source.
///
/// `uniform(lo, hi)` draws from `[lo, hi)`. Implementations must return `lo`
/// when the span is empty (`hi <= lo`).
pub trait RandomSource: Send + Sync {
    fn uniform(&self, lo: f64, hi: f64) -> f64;
}

/// Default clock over the tokio timer.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Default randomness over the thread-local PRNG.
#[derive(Debug, Clone, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn uniform(&self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        rand::thread_rng().gen_range(lo..hi)
    }
}

/// Hand-cranked clock for tests. Starts at zero and advances only when told.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    /// Jump the clock to an absolute reading.
    pub fn set(&self, to: Duration) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}

/// Deterministic randomness for tests: always the same fraction of the span.
///
/// `FixedRandom::midpoint()` yields the middle of every requested range.
#[derive(Debug, Clone)]
pub struct FixedRandom {
    fraction: f64,
}

impl FixedRandom {
    /// A source that returns `lo + (hi - lo) * fraction`.
    pub fn new(fraction: f64) -> Self {
        Self { fraction }
    }

    /// A source that returns the midpoint of every range.
    pub fn midpoint() -> Self {
        Self::new(0.5)
    }
}

impl RandomSource for FixedRandom {
    fn uniform(&self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        lo + (hi - lo) * self.fraction
    }
}
