//! Observable throttle state: lifecycle states, snapshots, and events.

use std::fmt;

use serde::Serialize;

/// Coarse throttle state as reported by snapshots.
///
/// `CircuitOpen` mirrors the breaker; `Closed` and `Draining` reflect the
/// lifecycle. Everything else is `Running` or `Cooling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    Running,
    Cooling,
    CircuitOpen,
    Closed,
    Draining,
}

impl fmt::Display for ThrottleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThrottleState::Running => "running",
            ThrottleState::Cooling => "cooling",
            ThrottleState::CircuitOpen => "circuit_open",
            ThrottleState::Closed => "closed",
            ThrottleState::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Immutable point-in-time view of all observable throttle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleSnapshot {
    /// Current concurrency limit.
    pub concurrency: usize,
    /// Configured absolute ceiling.
    pub max_concurrency: usize,
    /// Current dispatch interval in seconds.
    pub dispatch_interval: f64,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    /// Failures currently inside the sliding window.
    pub failure_count: usize,
    pub state: ThrottleState,
    pub safe_ceiling: usize,
    /// Estimated seconds remaining; `None` when unknown.
    pub eta_seconds: Option<f64>,
    pub tokens_used: u64,
    /// `None` when no token budget is configured.
    pub tokens_remaining: Option<u64>,
}

/// Structured event emitted through the state-change sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleEvent {
    /// Monotonic clock reading at emission, in seconds.
    pub timestamp_secs: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// One variant per event kind, each carrying its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Decelerated {
        old_concurrency: usize,
        new_concurrency: usize,
        old_interval: f64,
        new_interval: f64,
        /// Window count at the moment the threshold tripped.
        failure_count: usize,
    },
    Reaccelerated {
        old_concurrency: usize,
        new_concurrency: usize,
        old_interval: f64,
        new_interval: f64,
    },
    CoolingStarted {
        cooling_period: f64,
    },
    CircuitOpened {
        consecutive_failures: u32,
        retry_after: f64,
    },
    CircuitClosed,
    Retry {
        /// Index of the attempt about to run (1 for the first retry).
        attempt: u32,
        delay_secs: f64,
        error_kind: String,
    },
    Progress(ThrottleSnapshot),
    Closed,
    Draining {
        in_flight: usize,
    },
    Drained,
}

impl EventKind {
    /// Stable name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Decelerated { .. } => "decelerated",
            EventKind::Reaccelerated { .. } => "reaccelerated",
            EventKind::CoolingStarted { .. } => "cooling_started",
            EventKind::CircuitOpened { .. } => "circuit_opened",
            EventKind::CircuitClosed => "circuit_closed",
            EventKind::Retry { .. } => "retry",
            EventKind::Progress(_) => "progress",
            EventKind::Closed => "closed",
            EventKind::Draining { .. } => "draining",
            EventKind::Drained => "drained",
        }
    }
}
