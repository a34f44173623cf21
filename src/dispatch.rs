//! Dispatch spacing with jitter.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use crate::clock::{Clock, RandomSource};

#[derive(Debug)]
struct GateState {
    interval: f64,
    last_dispatch: Option<Duration>,
}

/// Enforces a minimum time gap between consecutive dispatches, plus additive
/// uniform jitter to keep coordinated callers from landing in lockstep.
///
/// Each waiter computes its delay against the `last_dispatch` stamp it
/// observes and advances the stamp after its own sleep resolves; bursts
/// within the jitter width are accepted by design.
pub struct DispatchGate {
    jitter_fraction: f64,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn RandomSource>,
    state: Mutex<GateState>,
}

impl DispatchGate {
    pub fn new(
        interval: f64,
        jitter_fraction: f64,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            jitter_fraction,
            clock,
            rng,
            state: Mutex::new(GateState {
                interval,
                last_dispatch: None,
            }),
        }
    }

    /// Current dispatch interval in seconds.
    pub fn interval(&self) -> f64 {
        self.state.lock().unwrap().interval
    }

    /// Sleep until the next dispatch is allowed, then stamp it.
    pub async fn wait(&self) {
        let delay = {
            let state = self.state.lock().unwrap();
            let remaining = match state.last_dispatch {
                Some(last) => {
                    let elapsed = self.clock.now().saturating_sub(last).as_secs_f64();
                    (state.interval - elapsed).max(0.0)
                }
                None => 0.0,
            };
            let span = state.interval * self.jitter_fraction;
            remaining + self.rng.uniform(0.0, span)
        };

        if delay > 0.0 {
            sleep(Duration::from_secs_f64(delay)).await;
        }

        self.state.lock().unwrap().last_dispatch = Some(self.clock.now());
    }

    /// Double the interval, capped. Returns `(old, new)`.
    pub fn decelerate(&self, max_interval: f64) -> (f64, f64) {
        let mut state = self.state.lock().unwrap();
        let old = state.interval;
        state.interval = (old * 2.0).min(max_interval);
        (old, state.interval)
    }

    /// Halve the interval, floored. Returns `(old, new)`.
    pub fn reaccelerate(&self, min_interval: f64) -> (f64, f64) {
        let mut state = self.state.lock().unwrap();
        let old = state.interval;
        state.interval = (old / 2.0).max(min_interval);
        (old, state.interval)
    }
}
