//! Rolling-window token budget.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use crate::clock::Clock;
use crate::config::TokenBudget;
use crate::error::ThrottleError;
use crate::window::SlidingWindow;

/// Quota over a countable resource (tokens, credits, bytes) consumed within a
/// rolling time window.
///
/// Accounting is post-hoc: callers commit usage with [`consume`] after an
/// operation succeeds, and [`wait_for_budget`] suspends new work until enough
/// old usage has rolled out of the window.
///
/// [`consume`]: TokenBucket::consume
/// [`wait_for_budget`]: TokenBucket::wait_for_budget
pub struct TokenBucket {
    budget: TokenBudget,
    clock: Arc<dyn Clock>,
    window: Mutex<SlidingWindow>,
}

impl TokenBucket {
    pub fn new(budget: TokenBudget, clock: Arc<dyn Clock>) -> Self {
        let window = SlidingWindow::new(budget.window_seconds, clock.clone());
        Self {
            budget,
            clock,
            window: Mutex::new(window),
        }
    }

    /// Commit token usage at the current time.
    pub fn consume(&self, tokens: u64) {
        self.window.lock().unwrap().record(tokens as f64);
    }

    /// Tokens consumed within the current window.
    pub fn tokens_used(&self) -> u64 {
        self.window.lock().unwrap().total() as u64
    }

    /// Tokens still available within the current window.
    pub fn tokens_remaining(&self) -> u64 {
        self.budget.max_tokens.saturating_sub(self.tokens_used())
    }

    /// Suspend until at least `tokens` are available in the window.
    ///
    /// The wait is computed from the window log: sleep until the oldest entry
    /// expires, then re-check. Requests that can never be satisfied are
    /// rejected up front.
    pub async fn wait_for_budget(&self, tokens: u64) -> Result<(), ThrottleError> {
        if tokens == 0 {
            return Ok(());
        }
        if tokens > self.budget.max_tokens {
            return Err(ThrottleError::InvalidArgument(format!(
                "requested {tokens} tokens but the budget is {}",
                self.budget.max_tokens
            )));
        }

        loop {
            let sleep_for = {
                let mut window = self.window.lock().unwrap();
                let used = window.total() as u64;
                if self.budget.max_tokens.saturating_sub(used) >= tokens {
                    return Ok(());
                }
                match window.oldest_timestamp() {
                    Some(oldest) => {
                        let expires_at = oldest + Duration::from_secs_f64(self.budget.window_seconds);
                        expires_at.saturating_sub(self.clock.now())
                    }
                    // Over budget with an empty window cannot happen; bail
                    // rather than loop.
                    None => return Ok(()),
                }
            };
            sleep(sleep_for).await;
        }
    }
}
