//! The throttle orchestrator.
//!
//! Wires the concurrency controller, dispatch gate, token bucket, circuit
//! breaker, failure window, progress tracker, and retry handler into one
//! admission pipeline. The mutable orchestrator state lives behind a single
//! short-lived mutex that is never held across a suspension point; the
//! suspension points themselves (concurrency acquire, dispatch sleep, token
//! sleep, the user callable, retry backoff) all happen with the lock
//! released.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerState, BreakerTransition, CircuitBreaker};
use crate::clock::{Clock, MonotonicClock, RandomSource, ThreadRandom};
use crate::concurrency::ConcurrencyController;
use crate::config::ThrottleConfig;
use crate::dispatch::DispatchGate;
use crate::error::{BoxError, Result, ThrottleError};
use crate::events::{EventKind, ThrottleEvent, ThrottleSnapshot, ThrottleState};
use crate::progress::ProgressTracker;
use crate::retry::RetryHandler;
use crate::slot::Slot;
use crate::token_bucket::TokenBucket;
use crate::window::SlidingWindow;

// Orchestrator state guarded by one lock: the failure window, cooling
// timestamps, safe ceiling, breaker, and progress counters transition
// together, and snapshots read them under the same lock.
struct Inner {
    state: ThrottleState,
    safe_ceiling: usize,
    cooling_start: Option<Duration>,
    last_failure_at: Option<Duration>,
    failure_window: SlidingWindow,
    progress: ProgressTracker,
    breaker: Option<CircuitBreaker>,
}

/// Adaptive rate-throttle coordinator.
///
/// Gates outbound operations behind a dynamic concurrency cap, minimum
/// dispatch spacing with jitter, an optional rolling token budget, and an
/// optional circuit breaker, while continuously re-tuning the limits from
/// observed successes and failures. Construct once, share via `Arc`, and run
/// every outbound call through [`execute`](Throttle::execute).
pub struct Throttle {
    config: ThrottleConfig,
    clock: Arc<dyn Clock>,
    concurrency: ConcurrencyController,
    dispatch: DispatchGate,
    token_bucket: Option<TokenBucket>,
    retry: Option<RetryHandler>,
    inner: Mutex<Inner>,
}

impl Throttle {
    /// Build a throttle with the default monotonic clock and PRNG.
    pub fn new(config: ThrottleConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()), Arc::new(ThreadRandom))
    }

    /// Build a throttle with injected time and randomness. Tests hand in
    /// [`ManualClock`](crate::clock::ManualClock) and
    /// [`FixedRandom`](crate::clock::FixedRandom) to make every timing
    /// decision deterministic.
    pub fn with_clock(
        config: ThrottleConfig,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn RandomSource>,
    ) -> Result<Self> {
        config.validate()?;

        let concurrency =
            ConcurrencyController::new(config.max_concurrency, config.initial_concurrency);
        let dispatch = DispatchGate::new(
            config.min_dispatch_interval,
            config.jitter_fraction,
            clock.clone(),
            rng.clone(),
        );
        let token_bucket = config
            .token_budget
            .map(|budget| TokenBucket::new(budget, clock.clone()));
        let breaker = config
            .circuit_breaker
            .map(|cb| CircuitBreaker::new(cb, clock.clone()));
        let retry = config
            .retry
            .clone()
            .map(|retry| RetryHandler::new(retry, rng.clone()));

        let inner = Inner {
            state: ThrottleState::Running,
            safe_ceiling: config.max_concurrency,
            cooling_start: None,
            last_failure_at: None,
            failure_window: SlidingWindow::new(config.failure_window, clock.clone()),
            progress: ProgressTracker::new(config.total_tasks),
            breaker,
        };

        Ok(Self {
            config,
            clock,
            concurrency,
            dispatch,
            token_bucket,
            retry,
            inner: Mutex::new(inner),
        })
    }

    /// Build from a nested key-value mapping. See
    /// [`ThrottleConfig::from_value`].
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Self::new(ThrottleConfig::from_value(value)?)
    }

    /// Build from environment variables with the given prefix. See
    /// [`ThrottleConfig::from_env`].
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::new(ThrottleConfig::from_env(prefix)?)
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Run an operation under the throttle.
    ///
    /// The callable receives a [`Slot`] for token reporting and attempt
    /// inspection. Admission runs the full sequence: lifecycle check, circuit
    /// check, concurrency acquire, dispatch-gate wait, token-budget wait.
    /// With retry configured, transient failures re-run the callable on the
    /// backoff schedule. User faults always propagate unchanged; throttle
    /// faults are boxed [`ThrottleError`] values.
    pub async fn execute<T, F, Fut>(&self, mut f: F) -> std::result::Result<T, BoxError>
    where
        F: FnMut(Slot) -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        self.admit().await?;
        let _release = ReleaseOnDrop { throttle: self };

        self.dispatch.wait().await;
        if let Some(bucket) = &self.token_bucket {
            bucket.wait_for_budget(1).await.map_err(box_err)?;
        }

        let slot = Slot::new();
        let max_attempts = self.retry.as_ref().map_or(1, RetryHandler::max_attempts);
        let mut attempt: u32 = 0;

        loop {
            slot.set_attempt(attempt);
            let attempt_start = self.clock.now();

            match f(slot.clone()).await {
                Ok(value) => {
                    let duration = self
                        .clock
                        .now()
                        .saturating_sub(attempt_start)
                        .as_secs_f64();
                    self.handle_success(duration, slot.tokens_reported());
                    return Ok(value);
                }
                Err(err) => {
                    let last_attempt = attempt + 1 >= max_attempts;
                    let delay = match &self.retry {
                        Some(handler) if !last_attempt && handler.is_retryable(&err) => {
                            handler.compute_delay(attempt)
                        }
                        _ => {
                            self.handle_failure(&err);
                            return Err(err);
                        }
                    };

                    // Intermediate failures feed the breaker's consecutive
                    // count but not the adaptive failure window.
                    if let Some(open) = self.record_intermediate_failure() {
                        return Err(Box::new(open));
                    }

                    attempt += 1;
                    debug!(attempt, delay, error = %err, "retrying after transient failure");
                    self.emit(EventKind::Retry {
                        attempt,
                        delay_secs: delay,
                        error_kind: err.to_string(),
                    });
                    if delay > 0.0 {
                        sleep(Duration::from_secs_f64(delay)).await;
                    }
                }
            }
        }
    }

    /// Low-level scope-guarded admission: runs the full admission sequence
    /// and yields a permit holding the operation's [`Slot`].
    ///
    /// Call [`ThrottlePermit::complete`] or [`ThrottlePermit::complete_err`]
    /// to record the outcome; dropping the permit without completing releases
    /// the concurrency slot but records nothing, which is the cancellation
    /// path. Retry does not apply here.
    pub async fn acquire(&self) -> std::result::Result<ThrottlePermit<'_>, BoxError> {
        self.admit().await?;
        // Duration spans from concurrency admission to completion, dispatch
        // and token waits included.
        let permit = ThrottlePermit {
            throttle: self,
            slot: Slot::new(),
            started_at: self.clock.now(),
            done: false,
        };

        self.dispatch.wait().await;
        if let Some(bucket) = &self.token_bucket {
            // On error the half-built permit drops and frees the slot.
            bucket.wait_for_budget(1).await.map_err(box_err)?;
        }

        Ok(permit)
    }

    /// Wrap a zero-argument async callable so every invocation runs through
    /// [`execute`](Throttle::execute).
    pub fn wrap<T, F, Fut>(
        self: &Arc<Self>,
        f: F,
    ) -> impl Fn() -> BoxFuture<'static, std::result::Result<T, BoxError>>
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
        T: Send + 'static,
    {
        let throttle = Arc::clone(self);
        move || {
            let throttle = Arc::clone(&throttle);
            let f = f.clone();
            Box::pin(async move { throttle.execute(move |_slot| f()).await })
        }
    }

    /// Record a success without going through the admission path.
    pub fn record_success(&self, duration_secs: f64, tokens_used: u64) {
        self.handle_success(duration_secs, tokens_used);
    }

    /// Record a failure without going through the admission path.
    pub fn record_failure(&self, err: &BoxError) {
        self.handle_failure(err);
    }

    /// Commit token usage directly to the budget window.
    pub fn record_tokens(&self, count: u64) {
        if let Some(bucket) = &self.token_bucket {
            bucket.consume(count);
        }
    }

    /// Assemble a consistent point-in-time snapshot.
    pub fn snapshot(&self) -> ThrottleSnapshot {
        let mut inner = self.inner.lock().unwrap();
        self.snapshot_locked(&mut inner)
    }

    /// Stop accepting new work. Idempotent; in-flight operations finish
    /// undisturbed.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(
                inner.state,
                ThrottleState::Closed | ThrottleState::Draining
            ) {
                return;
            }
            inner.state = if self.concurrency.in_flight() > 0 {
                ThrottleState::Draining
            } else {
                ThrottleState::Closed
            };
        }
        info!("throttle closed; no new work accepted");
        self.emit(EventKind::Closed);
    }

    /// Stop accepting new work and resolve once every in-flight operation
    /// has completed.
    pub async fn drain(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ThrottleState::Draining;
        }
        let in_flight = self.concurrency.in_flight();
        info!(in_flight, "draining in-flight work");
        self.emit(EventKind::Draining { in_flight });

        self.concurrency.wait_idle().await;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ThrottleState::Closed;
        }
        info!("drain complete; throttle closed");
        self.emit(EventKind::Drained);
    }

    // Admission steps 1-3: lifecycle check, circuit check, concurrency
    // acquire. The caller owns the release.
    async fn admit(&self) -> std::result::Result<(), BoxError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(
                inner.state,
                ThrottleState::Closed | ThrottleState::Draining
            ) {
                return Err(Box::new(ThrottleError::Closed));
            }
            if let Some(breaker) = inner.breaker.as_mut() {
                breaker.check().map_err(box_err)?;
            }
        }
        self.concurrency.acquire().await;
        Ok(())
    }

    fn handle_success(&self, duration_secs: f64, tokens: u64) {
        let mut events: Vec<EventKind> = Vec::new();
        let mut milestone: Option<ThrottleSnapshot> = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let now = self.clock.now();

            if let Some(breaker) = inner.breaker.as_mut() {
                if breaker.record_success() == Some(BreakerTransition::Closed) {
                    events.push(EventKind::CircuitClosed);
                }
            }

            if inner.state == ThrottleState::Cooling {
                let cooled = inner.cooling_start.map_or(false, |start| {
                    now.saturating_sub(start).as_secs_f64() >= self.config.cooling_period
                });
                if cooled && inner.failure_window.count() == 0 {
                    let (old_c, new_c) = self.concurrency.reaccelerate(inner.safe_ceiling);
                    let (old_i, new_i) =
                        self.dispatch.reaccelerate(self.config.min_dispatch_interval);
                    inner.state = ThrottleState::Running;
                    inner.cooling_start = None;

                    // Back at the ceiling after a long quiet stretch: allow
                    // recovery all the way to the configured maximum again.
                    let decay_threshold =
                        self.config.cooling_period * self.config.safe_ceiling_decay_multiplier;
                    let quiet = inner.last_failure_at.map_or(true, |at| {
                        now.saturating_sub(at).as_secs_f64() >= decay_threshold
                    });
                    if new_c == inner.safe_ceiling && quiet {
                        inner.safe_ceiling = self.config.max_concurrency;
                    }

                    events.push(EventKind::Reaccelerated {
                        old_concurrency: old_c,
                        new_concurrency: new_c,
                        old_interval: old_i,
                        new_interval: new_i,
                    });
                }
            }

            // Ceiling decay runs on every success, whether or not the
            // reaccelerate branch fired.
            if let Some(at) = inner.last_failure_at {
                let decay_threshold =
                    self.config.cooling_period * self.config.safe_ceiling_decay_multiplier;
                if now.saturating_sub(at).as_secs_f64() >= decay_threshold {
                    let old_ceiling = inner.safe_ceiling;
                    inner.safe_ceiling = self.config.max_concurrency;
                    inner.last_failure_at = None;
                    if old_ceiling != inner.safe_ceiling {
                        info!(
                            old = old_ceiling,
                            new = inner.safe_ceiling,
                            "safe ceiling restored"
                        );
                    }
                }
            }

            if tokens > 0 {
                if let Some(bucket) = &self.token_bucket {
                    bucket.consume(tokens);
                }
            }

            if inner.progress.record_completion(duration_secs) {
                milestone = Some(self.snapshot_locked(&mut inner));
            }
        }

        for kind in events {
            self.emit(kind);
        }
        if let Some(snapshot) = milestone {
            if let Some(callback) = &self.config.on_progress {
                callback(&snapshot);
            }
            self.emit(EventKind::Progress(snapshot));
        }
    }

    fn handle_failure(&self, err: &BoxError) {
        if let Some(predicate) = &self.config.failure_predicate {
            if !predicate(err) {
                return;
            }
        }

        let mut events: Vec<EventKind> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let now = self.clock.now();
            inner.failure_window.record(1.0);
            inner.last_failure_at = Some(now);

            if let Some(breaker) = inner.breaker.as_mut() {
                if let Some(BreakerTransition::Opened {
                    consecutive_failures,
                    retry_after,
                }) = breaker.record_failure()
                {
                    events.push(EventKind::CircuitOpened {
                        consecutive_failures,
                        retry_after,
                    });
                }
            }

            let failure_count = inner.failure_window.count();
            if failure_count >= self.config.failure_threshold {
                let (old_c, new_c) = self.concurrency.decelerate();
                let (old_i, new_i) = self.dispatch.decelerate(self.config.max_dispatch_interval);
                inner.safe_ceiling = old_c;
                // Counted failures must not cascade into another
                // deceleration.
                inner.failure_window.clear();
                inner.state = ThrottleState::Cooling;
                inner.cooling_start = Some(now);

                events.push(EventKind::Decelerated {
                    old_concurrency: old_c,
                    new_concurrency: new_c,
                    old_interval: old_i,
                    new_interval: new_i,
                    failure_count,
                });
                events.push(EventKind::CoolingStarted {
                    cooling_period: self.config.cooling_period,
                });
            }
        }

        for kind in events {
            self.emit(kind);
        }
    }

    // Breaker bookkeeping for a retryable failure inside the retry loop.
    // Returns the fault to propagate when the breaker trips.
    fn record_intermediate_failure(&self) -> Option<ThrottleError> {
        let opened = {
            let mut inner = self.inner.lock().unwrap();
            match inner.breaker.as_mut().map(CircuitBreaker::record_failure) {
                Some(Some(BreakerTransition::Opened {
                    consecutive_failures,
                    retry_after,
                })) => Some((consecutive_failures, retry_after)),
                _ => None,
            }
        };
        opened.map(|(consecutive_failures, retry_after)| {
            self.emit(EventKind::CircuitOpened {
                consecutive_failures,
                retry_after,
            });
            ThrottleError::CircuitOpen { retry_after }
        })
    }

    fn snapshot_locked(&self, inner: &mut Inner) -> ThrottleSnapshot {
        let breaker_open = inner
            .breaker
            .as_mut()
            .map_or(false, |breaker| breaker.state() == BreakerState::Open);
        let state = if breaker_open {
            ThrottleState::CircuitOpen
        } else {
            inner.state
        };
        let concurrency = self.concurrency.current_limit();
        ThrottleSnapshot {
            concurrency,
            max_concurrency: self.config.max_concurrency,
            dispatch_interval: self.dispatch.interval(),
            completed_tasks: inner.progress.completed(),
            total_tasks: self.config.total_tasks,
            failure_count: inner.failure_window.count(),
            state,
            safe_ceiling: inner.safe_ceiling,
            eta_seconds: inner.progress.eta_seconds(concurrency),
            tokens_used: self.token_bucket.as_ref().map_or(0, TokenBucket::tokens_used),
            tokens_remaining: self.token_bucket.as_ref().map(TokenBucket::tokens_remaining),
        }
    }

    fn emit(&self, kind: EventKind) {
        match &kind {
            EventKind::Decelerated {
                old_concurrency,
                new_concurrency,
                old_interval,
                new_interval,
                ..
            } => info!(
                old_concurrency,
                new_concurrency, old_interval, new_interval, "decelerated under failure pressure"
            ),
            EventKind::Reaccelerated {
                old_concurrency,
                new_concurrency,
                ..
            } => info!(old_concurrency, new_concurrency, "reaccelerated after cooling"),
            EventKind::CoolingStarted { cooling_period } => {
                info!(cooling_period, "cooling started")
            }
            EventKind::CircuitOpened {
                consecutive_failures,
                retry_after,
            } => warn!(consecutive_failures, retry_after, "circuit opened"),
            EventKind::CircuitClosed => info!("circuit closed"),
            _ => {}
        }

        if let Some(callback) = &self.config.on_state_change {
            callback(&ThrottleEvent {
                timestamp_secs: self.clock.now().as_secs_f64(),
                kind,
            });
        }
    }
}

fn box_err(err: ThrottleError) -> BoxError {
    Box::new(err)
}

struct ReleaseOnDrop<'a> {
    throttle: &'a Throttle,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.throttle.concurrency.release();
    }
}

/// Scope guard yielded by [`Throttle::acquire`].
///
/// Holds the concurrency slot for one operation. Exactly one outcome can be
/// recorded; an uncompleted drop releases the slot without touching the
/// failure window or breaker.
pub struct ThrottlePermit<'a> {
    throttle: &'a Throttle,
    slot: Slot,
    started_at: Duration,
    done: bool,
}

impl std::fmt::Debug for ThrottlePermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottlePermit")
            .field("slot", &self.slot)
            .field("started_at", &self.started_at)
            .field("done", &self.done)
            .finish()
    }
}

impl ThrottlePermit<'_> {
    /// The operation's slot, for token reporting.
    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    /// Record a successful outcome, measuring duration since admission.
    pub fn complete(mut self) {
        self.done = true;
        let duration = self
            .throttle
            .clock
            .now()
            .saturating_sub(self.started_at)
            .as_secs_f64();
        self.throttle
            .handle_success(duration, self.slot.tokens_reported());
        self.throttle.concurrency.release();
    }

    /// Record a failed outcome.
    pub fn complete_err(mut self, err: &BoxError) {
        self.done = true;
        self.throttle.handle_failure(err);
        self.throttle.concurrency.release();
    }
}

impl Drop for ThrottlePermit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.throttle.concurrency.release();
        }
    }
}
