//! # gentlify
//!
//! Adaptive rate-throttle coordination for cooperative async applications
//! that call external services. A single [`Throttle`] gates outbound work by:
//!
//! - bounding simultaneous in-flight operations behind a dynamic concurrency
//!   cap,
//! - enforcing minimum spacing between dispatches with randomized jitter,
//! - optionally rationing a countable per-window resource (tokens, credits),
//! - optionally short-circuiting after sustained failure (circuit breaker),
//! - optionally retrying transient failures on a configurable backoff,
//!
//! and continuously re-tuning those limits from observed success and failure
//! signals: sustained failures halve concurrency and double the dispatch
//! interval, a quiet cooling period walks them back toward a safe ceiling.
//!
//! ## Core Concepts
//!
//! - **[`Throttle`]**: the coordinator. Construct once, share via `Arc`, run
//!   every outbound call through [`Throttle::execute`].
//! - **[`Slot`]**: per-operation handle passed to your callable; report token
//!   usage through it and inspect the current attempt index.
//! - **[`ThrottleConfig`]**: validated tunables, buildable fluently, from a
//!   nested JSON value, or from `GENTLIFY_*` environment variables.
//! - **[`ThrottleSnapshot`]** / **[`ThrottleEvent`]**: the observability
//!   surface; snapshots are consistent point-in-time reads, events fire on
//!   state transitions.
//! - **[`ThrottleLayer`]**: tower middleware that routes any boxed-error
//!   service through the throttle.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use gentlify::{BoxError, Throttle, ThrottleConfig, TokenBudget};
//! use std::sync::Arc;
//!
//! # async fn call_api(prompt: &str) -> Result<(String, u64), BoxError> { unimplemented!() }
//! # async fn run() -> Result<(), BoxError> {
//! let throttle = Arc::new(Throttle::new(
//!     ThrottleConfig::builder()
//!         .max_concurrency(8)
//!         .token_budget(TokenBudget {
//!             max_tokens: 90_000,
//!             window_seconds: 60.0,
//!         })
//!         .build()?,
//! )?);
//!
//! let answer = throttle
//!     .execute(|slot| async move {
//!         let (text, tokens) = call_api("hello").await?;
//!         slot.record_tokens(tokens);
//!         Ok::<_, BoxError>(text)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Timing and randomness are injected ([`Clock`], [`RandomSource`]), so the
//! whole engine is deterministic under test: combine
//! [`ManualClock`]/[`FixedRandom`] with tokio's paused time and every sleep
//! and clock read resolves instantly and reproducibly.
//!
//! The throttle never suppresses user faults: whatever your callable returns
//! as an error propagates unchanged, counted along the way. The throttle's
//! own admission faults are boxed [`ThrottleError`] values, recoverable with
//! `downcast_ref`.

pub mod circuit_breaker;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod progress;
pub mod retry;
pub mod service;
pub mod slot;
pub mod throttle;
pub mod token_bucket;
pub mod window;

// Re-export the primary surface for convenience.
pub use clock::{Clock, FixedRandom, ManualClock, MonotonicClock, RandomSource, ThreadRandom};
pub use config::{
    BackoffKind, CircuitBreakerConfig, RetryConfig, ThrottleConfig, ThrottleConfigBuilder,
    TokenBudget,
};
pub use error::{BoxError, Result, ThrottleError};
pub use events::{EventKind, ThrottleEvent, ThrottleSnapshot, ThrottleState};
pub use service::{ThrottleLayer, ThrottleService};
pub use slot::Slot;
pub use throttle::{Throttle, ThrottlePermit};
