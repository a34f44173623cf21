//! # Error Handling
//!
//! This module defines the faults the throttle itself can produce. Everything
//! else that flows out of [`Throttle::execute`](crate::Throttle::execute) is a
//! user error passing through untouched.
//!
//! ## The `ThrottleError` Enum
//!
//! [`ThrottleError`] covers the three admission-time fault kinds (invalid
//! configuration, open circuit, closed throttle) plus invalid arguments to
//! budget waits. The use of `thiserror` keeps the messages descriptive and the
//! variants cheap to match on.
//!
//! ## User errors
//!
//! The operation callables run by the throttle return [`BoxError`], the
//! conventional boxed error type for async middleware stacks. Throttle faults
//! are boxed into the same channel, so a caller distinguishes them with
//! `err.downcast_ref::<ThrottleError>()`:
//!
//! ```rust
//! use gentlify::{BoxError, ThrottleError};
//!
//! fn is_circuit_open(err: &BoxError) -> bool {
//!     matches!(
//!         err.downcast_ref::<ThrottleError>(),
//!         Some(ThrottleError::CircuitOpen { .. })
//!     )
//! }
//!
//! let err: BoxError = Box::new(ThrottleError::CircuitOpen { retry_after: 3.0 });
//! assert!(is_circuit_open(&err));
//! ```

use thiserror::Error;

/// Boxed error type carried by throttled operations.
///
/// User callables produce it, the throttle re-propagates it, and the
/// throttle's own faults are boxed into it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` for operations that can only fail with a
/// [`ThrottleError`].
pub type Result<T> = std::result::Result<T, ThrottleError>;

/// Faults produced by the throttle itself.
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// A configuration field violated its constraint. Raised during
    /// construction, before any work is admitted.
    #[error("invalid configuration: {field}: {message}")]
    InvalidConfig {
        /// The offending field (or environment variable) name.
        field: String,
        /// Which constraint was violated.
        message: String,
    },

    /// Admission refused because the circuit breaker is open.
    #[error("circuit breaker is open; retry after {retry_after:.1}s")]
    CircuitOpen {
        /// Seconds until the breaker becomes eligible for a half-open probe.
        retry_after: f64,
    },

    /// Admission refused because [`close`](crate::Throttle::close) was called.
    #[error("throttle is closed and no longer accepting work")]
    Closed,

    /// A caller-supplied value that can never be satisfied, such as a token
    /// request larger than the whole budget.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ThrottleError {
    pub(crate) fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        ThrottleError::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }
}
