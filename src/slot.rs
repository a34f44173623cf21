//! Per-operation handle.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Handle passed to the operation run under the throttle.
///
/// The operation reports token consumption through it, and can inspect which
/// attempt it is running as. Clones share state, so the handle can be moved
/// into the operation future while the throttle keeps reading it.
#[derive(Debug, Clone)]
pub struct Slot {
    shared: Arc<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    tokens: AtomicU64,
    attempt: AtomicU32,
}

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(SlotState::default()),
        }
    }

    /// Report token consumption for this operation. Reports accumulate and
    /// are committed to the token budget when the operation succeeds.
    pub fn record_tokens(&self, count: u64) {
        self.shared.tokens.fetch_add(count, Ordering::Relaxed);
    }

    /// Tokens reported so far.
    pub fn tokens_reported(&self) -> u64 {
        self.shared.tokens.load(Ordering::Relaxed)
    }

    /// Zero-indexed attempt number: 0 on the first call, incremented per
    /// retry.
    pub fn attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::Relaxed)
    }

    pub(crate) fn set_attempt(&self, attempt: u32) {
        self.shared.attempt.store(attempt, Ordering::Relaxed);
    }
}
