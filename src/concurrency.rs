//! Dynamic concurrency control.
//!
//! A resizable ceiling on in-flight operations. Pressure halves the limit,
//! recovery raises it one step at a time toward a ceiling, and resizing never
//! revokes permits already held: shrinking first forgets whatever permits are
//! sitting idle in the semaphore and books the remainder as a deficit that is
//! repaid out of future releases. The effective cap therefore only ever moves
//! monotonically toward the new limit.

use std::sync::Mutex;

use tokio::sync::{Notify, Semaphore};

#[derive(Debug)]
struct ControllerState {
    limit: usize,
    in_flight: usize,
    // Permits owed after a shrink; releases repay these instead of
    // returning to the semaphore.
    deficit: usize,
}

/// Dynamic ceiling on simultaneous in-flight operations.
#[derive(Debug)]
pub struct ConcurrencyController {
    max_cap: usize,
    semaphore: Semaphore,
    state: Mutex<ControllerState>,
    idle: Notify,
}

impl ConcurrencyController {
    pub fn new(max_concurrency: usize, initial_concurrency: Option<usize>) -> Self {
        let limit = initial_concurrency.unwrap_or(max_concurrency);
        Self {
            max_cap: max_concurrency,
            semaphore: Semaphore::new(limit),
            state: Mutex::new(ControllerState {
                limit,
                in_flight: 0,
                deficit: 0,
            }),
            idle: Notify::new(),
        }
    }

    /// Current concurrency limit.
    pub fn current_limit(&self) -> usize {
        self.state.lock().unwrap().limit
    }

    /// Number of currently held slots.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    /// Suspend until an in-flight slot is available, then take it.
    pub async fn acquire(&self) {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("concurrency semaphore is never closed");
        permit.forget();
        self.state.lock().unwrap().in_flight += 1;
    }

    /// Return a slot taken by [`acquire`](Self::acquire).
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.deficit > 0 {
            state.deficit -= 1;
        } else {
            self.semaphore.add_permits(1);
        }
        if state.in_flight == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Halve the limit (floor 1). Returns `(old, new)`.
    pub fn decelerate(&self) -> (usize, usize) {
        let mut state = self.state.lock().unwrap();
        let old = state.limit;
        let new = (old / 2).max(1);
        self.apply_limit(&mut state, new);
        (old, new)
    }

    /// Raise the limit by one, capped at `ceiling` and the absolute maximum.
    /// Returns `(old, new)`.
    pub fn reaccelerate(&self, ceiling: usize) -> (usize, usize) {
        let mut state = self.state.lock().unwrap();
        let old = state.limit;
        let new = (old + 1).min(ceiling).min(self.max_cap).max(1);
        self.apply_limit(&mut state, new);
        (old, new)
    }

    /// Set the limit to an exact value, clamped to `[1, max]`.
    pub fn resize(&self, new_limit: usize) {
        let mut state = self.state.lock().unwrap();
        let new = new_limit.clamp(1, self.max_cap);
        self.apply_limit(&mut state, new);
    }

    /// Resolve once `in_flight` reaches zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state.lock().unwrap().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }

    fn apply_limit(&self, state: &mut ControllerState, new: usize) {
        let old = state.limit;
        state.limit = new;
        if new > old {
            let grow = new - old;
            let repaid = grow.min(state.deficit);
            state.deficit -= repaid;
            self.semaphore.add_permits(grow - repaid);
        } else if new < old {
            let shrink = old - new;
            let forgotten = self.semaphore.forget_permits(shrink);
            state.deficit += shrink - forgotten;
        }
    }
}
