//! Throttle configuration.
//!
//! [`ThrottleConfig`] bundles every tunable with validated-on-construct
//! semantics: any constraint violation surfaces as
//! [`ThrottleError::InvalidConfig`] naming the field and the constraint.
//! Besides the fluent [`ThrottleConfigBuilder`], configs load from a nested
//! JSON value ([`ThrottleConfig::from_value`]) and from environment variables
//! with a configurable prefix ([`ThrottleConfig::from_env`], default
//! `GENTLIFY`).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BoxError, Result, ThrottleError};
use crate::events::{ThrottleEvent, ThrottleSnapshot};

/// Decides whether a user fault counts as a failure signal.
pub type FailurePredicate = Arc<dyn Fn(&BoxError) -> bool + Send + Sync>;

/// Decides whether a user fault is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&BoxError) -> bool + Send + Sync>;

/// Sink for [`ThrottleEvent`]s.
pub type StateChangeCallback = Arc<dyn Fn(&ThrottleEvent) + Send + Sync>;

/// Sink for milestone [`ThrottleSnapshot`]s.
pub type ProgressCallback = Arc<dyn Fn(&ThrottleSnapshot) + Send + Sync>;

/// Rolling-window quota for a countable resource.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Tokens admissible within any window. Must be >= 1.
    pub max_tokens: u64,
    /// Window length in seconds. Must be > 0.
    pub window_seconds: f64,
}

/// Circuit breaker tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker. Must be >= 1.
    pub consecutive_failures: u32,
    /// Seconds the circuit stays open before the first probe. Must be >= 0.
    pub open_duration: f64,
    /// Probes admitted per half-open episode. Must be >= 1.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 10,
            open_duration: 30.0,
            half_open_max_calls: 1,
        }
    }
}

/// Backoff schedule shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
    ExponentialJitter,
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
            BackoffKind::ExponentialJitter => "exponential_jitter",
        };
        f.write_str(name)
    }
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            "exponential_jitter" => Ok(BackoffKind::ExponentialJitter),
            other => Err(format!(
                "expected one of fixed, exponential, exponential_jitter; got {other:?}"
            )),
        }
    }
}

/// Retry tunables.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call. Must be >= 1; 1 disables
    /// retry entirely.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    /// Base delay in seconds. Must be >= 0.
    pub base_delay: f64,
    /// Delay cap in seconds. Must be >= `base_delay`.
    pub max_delay: f64,
    /// Retryability predicate; every fault retries when absent.
    #[serde(skip)]
    pub retryable: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::ExponentialJitter,
            base_delay: 1.0,
            max_delay: 60.0,
            retryable: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("retryable", &self.retryable.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Complete throttle configuration. All fields optional with defaults;
/// validated on construction.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Absolute ceiling on in-flight operations. Must be >= 1.
    pub max_concurrency: usize,
    /// Starting concurrency limit; defaults to `max_concurrency`. When set,
    /// must lie in `[1, max_concurrency]`.
    pub initial_concurrency: Option<usize>,
    /// Floor for the dispatch interval, seconds. Must be >= 0.
    pub min_dispatch_interval: f64,
    /// Cap for the dispatch interval, seconds. Must be >= the floor.
    pub max_dispatch_interval: f64,
    /// Failures within the window that trigger deceleration. Must be >= 1.
    pub failure_threshold: usize,
    /// Failure window length, seconds. Must be > 0.
    pub failure_window: f64,
    /// Zero-failure seconds required before reacceleration. Must be > 0.
    pub cooling_period: f64,
    /// Multiplier on `cooling_period` before the safe ceiling resets. Must
    /// be > 0.
    pub safe_ceiling_decay_multiplier: f64,
    /// Fraction of the interval added as uniform jitter. Must lie in [0, 1].
    pub jitter_fraction: f64,
    /// Expected task count; enables percentage and ETA when > 0.
    pub total_tasks: usize,
    pub token_budget: Option<TokenBudget>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub retry: Option<RetryConfig>,
    #[serde(skip)]
    pub failure_predicate: Option<FailurePredicate>,
    #[serde(skip)]
    pub on_state_change: Option<StateChangeCallback>,
    #[serde(skip)]
    pub on_progress: Option<ProgressCallback>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            initial_concurrency: None,
            min_dispatch_interval: 0.2,
            max_dispatch_interval: 30.0,
            failure_threshold: 3,
            failure_window: 60.0,
            cooling_period: 60.0,
            safe_ceiling_decay_multiplier: 5.0,
            jitter_fraction: 0.5,
            total_tasks: 0,
            token_budget: None,
            circuit_breaker: None,
            retry: None,
            failure_predicate: None,
            on_state_change: None,
            on_progress: None,
        }
    }
}

impl fmt::Debug for ThrottleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleConfig")
            .field("max_concurrency", &self.max_concurrency)
            .field("initial_concurrency", &self.initial_concurrency)
            .field("min_dispatch_interval", &self.min_dispatch_interval)
            .field("max_dispatch_interval", &self.max_dispatch_interval)
            .field("failure_threshold", &self.failure_threshold)
            .field("failure_window", &self.failure_window)
            .field("cooling_period", &self.cooling_period)
            .field(
                "safe_ceiling_decay_multiplier",
                &self.safe_ceiling_decay_multiplier,
            )
            .field("jitter_fraction", &self.jitter_fraction)
            .field("total_tasks", &self.total_tasks)
            .field("token_budget", &self.token_budget)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("retry", &self.retry)
            .field(
                "failure_predicate",
                &self.failure_predicate.as_ref().map(|_| "<fn>"),
            )
            .field(
                "on_state_change",
                &self.on_state_change.as_ref().map(|_| "<fn>"),
            )
            .field("on_progress", &self.on_progress.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ThrottleConfig {
    /// Start building a configuration fluently.
    pub fn builder() -> ThrottleConfigBuilder {
        ThrottleConfigBuilder::default()
    }

    /// Build a validated configuration from a nested JSON value. The
    /// `token_budget`, `circuit_breaker`, and `retry` keys nest their own
    /// objects.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let config: ThrottleConfig = serde_json::from_value(value)
            .map_err(|e| ThrottleError::invalid_config("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a validated configuration from process environment variables
    /// with the given prefix (conventionally `GENTLIFY`).
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_env_iter(prefix, std::env::vars())
    }

    /// Build a validated configuration from an explicit variable set. This is
    /// the testable core of [`from_env`](Self::from_env).
    pub fn from_env_iter<I>(prefix: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let key = |suffix: &str| format!("{prefix}_{suffix}");
        let mut config = ThrottleConfig::default();

        if let Some(v) = parse_var::<usize>(&vars, &key("MAX_CONCURRENCY"))? {
            config.max_concurrency = v;
        }
        if let Some(v) = parse_var::<usize>(&vars, &key("INITIAL_CONCURRENCY"))? {
            config.initial_concurrency = Some(v);
        }
        if let Some(v) = parse_var::<f64>(&vars, &key("MIN_DISPATCH_INTERVAL"))? {
            config.min_dispatch_interval = v;
        }
        if let Some(v) = parse_var::<f64>(&vars, &key("MAX_DISPATCH_INTERVAL"))? {
            config.max_dispatch_interval = v;
        }
        if let Some(v) = parse_var::<usize>(&vars, &key("FAILURE_THRESHOLD"))? {
            config.failure_threshold = v;
        }
        if let Some(v) = parse_var::<f64>(&vars, &key("FAILURE_WINDOW"))? {
            config.failure_window = v;
        }
        if let Some(v) = parse_var::<f64>(&vars, &key("COOLING_PERIOD"))? {
            config.cooling_period = v;
        }
        if let Some(v) = parse_var::<f64>(&vars, &key("SAFE_CEILING_DECAY_MULTIPLIER"))? {
            config.safe_ceiling_decay_multiplier = v;
        }
        if let Some(v) = parse_var::<f64>(&vars, &key("JITTER_FRACTION"))? {
            config.jitter_fraction = v;
        }
        if let Some(v) = parse_var::<usize>(&vars, &key("TOTAL_TASKS"))? {
            config.total_tasks = v;
        }

        let tb_max = parse_var::<u64>(&vars, &key("TOKEN_BUDGET_MAX"))?;
        let tb_window = parse_var::<f64>(&vars, &key("TOKEN_BUDGET_WINDOW"))?;
        config.token_budget = match (tb_max, tb_window) {
            (Some(max_tokens), Some(window_seconds)) => Some(TokenBudget {
                max_tokens,
                window_seconds,
            }),
            (None, None) => None,
            _ => {
                return Err(ThrottleError::invalid_config(
                    key("TOKEN_BUDGET_MAX"),
                    "token budget requires both _TOKEN_BUDGET_MAX and _TOKEN_BUDGET_WINDOW",
                ))
            }
        };

        let cb_failures = parse_var::<u32>(&vars, &key("CIRCUIT_BREAKER_CONSECUTIVE_FAILURES"))?;
        let cb_duration = parse_var::<f64>(&vars, &key("CIRCUIT_BREAKER_OPEN_DURATION"))?;
        let cb_half_open = parse_var::<u32>(&vars, &key("CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS"))?;
        if cb_failures.is_some() || cb_duration.is_some() || cb_half_open.is_some() {
            let mut cb = CircuitBreakerConfig::default();
            if let Some(v) = cb_failures {
                cb.consecutive_failures = v;
            }
            if let Some(v) = cb_duration {
                cb.open_duration = v;
            }
            if let Some(v) = cb_half_open {
                cb.half_open_max_calls = v;
            }
            config.circuit_breaker = Some(cb);
        }

        let retry_attempts = parse_var::<u32>(&vars, &key("RETRY_MAX_ATTEMPTS"))?;
        let retry_base = parse_var::<f64>(&vars, &key("RETRY_BASE_DELAY"))?;
        let retry_max = parse_var::<f64>(&vars, &key("RETRY_MAX_DELAY"))?;
        let retry_backoff = match vars.get(&key("RETRY_BACKOFF")) {
            Some(raw) => Some(
                BackoffKind::from_str(raw)
                    .map_err(|e| ThrottleError::invalid_config(key("RETRY_BACKOFF"), e))?,
            ),
            None => None,
        };
        if retry_attempts.is_some()
            || retry_base.is_some()
            || retry_max.is_some()
            || retry_backoff.is_some()
        {
            let mut retry = RetryConfig::default();
            if let Some(v) = retry_attempts {
                retry.max_attempts = v;
            }
            if let Some(v) = retry_backoff {
                retry.backoff = v;
            }
            if let Some(v) = retry_base {
                retry.base_delay = v;
            }
            if let Some(v) = retry_max {
                retry.max_delay = v;
            }
            config.retry = Some(retry);
        }

        config.validate()?;
        Ok(config)
    }

    /// Render this configuration as the environment variables
    /// [`from_env_iter`](Self::from_env_iter) accepts. Callback fields have
    /// no representation and are omitted.
    pub fn to_env_map(&self, prefix: &str) -> Vec<(String, String)> {
        let key = |suffix: &str| format!("{prefix}_{suffix}");
        let mut vars = vec![
            (key("MAX_CONCURRENCY"), self.max_concurrency.to_string()),
            (
                key("MIN_DISPATCH_INTERVAL"),
                self.min_dispatch_interval.to_string(),
            ),
            (
                key("MAX_DISPATCH_INTERVAL"),
                self.max_dispatch_interval.to_string(),
            ),
            (key("FAILURE_THRESHOLD"), self.failure_threshold.to_string()),
            (key("FAILURE_WINDOW"), self.failure_window.to_string()),
            (key("COOLING_PERIOD"), self.cooling_period.to_string()),
            (
                key("SAFE_CEILING_DECAY_MULTIPLIER"),
                self.safe_ceiling_decay_multiplier.to_string(),
            ),
            (key("JITTER_FRACTION"), self.jitter_fraction.to_string()),
            (key("TOTAL_TASKS"), self.total_tasks.to_string()),
        ];
        if let Some(v) = self.initial_concurrency {
            vars.push((key("INITIAL_CONCURRENCY"), v.to_string()));
        }
        if let Some(tb) = &self.token_budget {
            vars.push((key("TOKEN_BUDGET_MAX"), tb.max_tokens.to_string()));
            vars.push((key("TOKEN_BUDGET_WINDOW"), tb.window_seconds.to_string()));
        }
        if let Some(cb) = &self.circuit_breaker {
            vars.push((
                key("CIRCUIT_BREAKER_CONSECUTIVE_FAILURES"),
                cb.consecutive_failures.to_string(),
            ));
            vars.push((
                key("CIRCUIT_BREAKER_OPEN_DURATION"),
                cb.open_duration.to_string(),
            ));
            vars.push((
                key("CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS"),
                cb.half_open_max_calls.to_string(),
            ));
        }
        if let Some(retry) = &self.retry {
            vars.push((key("RETRY_MAX_ATTEMPTS"), retry.max_attempts.to_string()));
            vars.push((key("RETRY_BACKOFF"), retry.backoff.to_string()));
            vars.push((key("RETRY_BASE_DELAY"), retry.base_delay.to_string()));
            vars.push((key("RETRY_MAX_DELAY"), retry.max_delay.to_string()));
        }
        vars
    }

    /// Check every constraint, reporting the first violation by field.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency < 1 {
            return Err(ThrottleError::invalid_config(
                "max_concurrency",
                format!("must be >= 1, got {}", self.max_concurrency),
            ));
        }
        if let Some(initial) = self.initial_concurrency {
            if initial < 1 || initial > self.max_concurrency {
                return Err(ThrottleError::invalid_config(
                    "initial_concurrency",
                    format!(
                        "must be between 1 and max_concurrency ({}), got {initial}",
                        self.max_concurrency
                    ),
                ));
            }
        }
        if self.min_dispatch_interval < 0.0 {
            return Err(ThrottleError::invalid_config(
                "min_dispatch_interval",
                format!("must be >= 0, got {}", self.min_dispatch_interval),
            ));
        }
        if self.max_dispatch_interval < self.min_dispatch_interval {
            return Err(ThrottleError::invalid_config(
                "max_dispatch_interval",
                format!(
                    "({}) must be >= min_dispatch_interval ({})",
                    self.max_dispatch_interval, self.min_dispatch_interval
                ),
            ));
        }
        if self.failure_threshold < 1 {
            return Err(ThrottleError::invalid_config(
                "failure_threshold",
                format!("must be >= 1, got {}", self.failure_threshold),
            ));
        }
        if self.failure_window <= 0.0 {
            return Err(ThrottleError::invalid_config(
                "failure_window",
                format!("must be > 0, got {}", self.failure_window),
            ));
        }
        if self.cooling_period <= 0.0 {
            return Err(ThrottleError::invalid_config(
                "cooling_period",
                format!("must be > 0, got {}", self.cooling_period),
            ));
        }
        if self.safe_ceiling_decay_multiplier <= 0.0 {
            return Err(ThrottleError::invalid_config(
                "safe_ceiling_decay_multiplier",
                format!("must be > 0, got {}", self.safe_ceiling_decay_multiplier),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ThrottleError::invalid_config(
                "jitter_fraction",
                format!("must be between 0.0 and 1.0, got {}", self.jitter_fraction),
            ));
        }
        if let Some(tb) = &self.token_budget {
            if tb.max_tokens < 1 {
                return Err(ThrottleError::invalid_config(
                    "token_budget.max_tokens",
                    format!("must be >= 1, got {}", tb.max_tokens),
                ));
            }
            if tb.window_seconds <= 0.0 {
                return Err(ThrottleError::invalid_config(
                    "token_budget.window_seconds",
                    format!("must be > 0, got {}", tb.window_seconds),
                ));
            }
        }
        if let Some(cb) = &self.circuit_breaker {
            if cb.consecutive_failures < 1 {
                return Err(ThrottleError::invalid_config(
                    "circuit_breaker.consecutive_failures",
                    format!("must be >= 1, got {}", cb.consecutive_failures),
                ));
            }
            if cb.open_duration < 0.0 {
                return Err(ThrottleError::invalid_config(
                    "circuit_breaker.open_duration",
                    format!("must be >= 0, got {}", cb.open_duration),
                ));
            }
            if cb.half_open_max_calls < 1 {
                return Err(ThrottleError::invalid_config(
                    "circuit_breaker.half_open_max_calls",
                    format!("must be >= 1, got {}", cb.half_open_max_calls),
                ));
            }
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts < 1 {
                return Err(ThrottleError::invalid_config(
                    "retry.max_attempts",
                    format!("must be >= 1, got {}", retry.max_attempts),
                ));
            }
            if retry.base_delay < 0.0 {
                return Err(ThrottleError::invalid_config(
                    "retry.base_delay",
                    format!("must be >= 0, got {}", retry.base_delay),
                ));
            }
            if retry.max_delay < retry.base_delay {
                return Err(ThrottleError::invalid_config(
                    "retry.max_delay",
                    format!(
                        "({}) must be >= base_delay ({})",
                        retry.max_delay, retry.base_delay
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ThrottleError::invalid_config(key, format!("{e} (value {raw:?})"))),
        None => Ok(None),
    }
}

/// Fluent configuration builder. `build()` validates.
#[derive(Default)]
pub struct ThrottleConfigBuilder {
    config: ThrottleConfig,
}

impl ThrottleConfigBuilder {
    pub fn max_concurrency(mut self, value: usize) -> Self {
        self.config.max_concurrency = value;
        self
    }

    pub fn initial_concurrency(mut self, value: usize) -> Self {
        self.config.initial_concurrency = Some(value);
        self
    }

    pub fn min_dispatch_interval(mut self, seconds: f64) -> Self {
        self.config.min_dispatch_interval = seconds;
        self
    }

    pub fn max_dispatch_interval(mut self, seconds: f64) -> Self {
        self.config.max_dispatch_interval = seconds;
        self
    }

    pub fn failure_threshold(mut self, value: usize) -> Self {
        self.config.failure_threshold = value;
        self
    }

    pub fn failure_window(mut self, seconds: f64) -> Self {
        self.config.failure_window = seconds;
        self
    }

    pub fn cooling_period(mut self, seconds: f64) -> Self {
        self.config.cooling_period = seconds;
        self
    }

    pub fn safe_ceiling_decay_multiplier(mut self, value: f64) -> Self {
        self.config.safe_ceiling_decay_multiplier = value;
        self
    }

    pub fn jitter_fraction(mut self, value: f64) -> Self {
        self.config.jitter_fraction = value;
        self
    }

    pub fn total_tasks(mut self, value: usize) -> Self {
        self.config.total_tasks = value;
        self
    }

    pub fn token_budget(mut self, budget: TokenBudget) -> Self {
        self.config.token_budget = Some(budget);
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = Some(breaker);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = Some(retry);
        self
    }

    pub fn failure_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BoxError) -> bool + Send + Sync + 'static,
    {
        self.config.failure_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ThrottleEvent) + Send + Sync + 'static,
    {
        self.config.on_state_change = Some(Arc::new(callback));
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ThrottleSnapshot) + Send + Sync + 'static,
    {
        self.config.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<ThrottleConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ThrottleConfig::default();
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.initial_concurrency, None);
        assert_eq!(config.min_dispatch_interval, 0.2);
        assert_eq!(config.max_dispatch_interval, 30.0);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.failure_window, 60.0);
        assert_eq!(config.cooling_period, 60.0);
        assert_eq!(config.safe_ceiling_decay_multiplier, 5.0);
        assert_eq!(config.jitter_fraction, 0.5);
        assert_eq!(config.total_tasks, 0);
        assert!(config.token_budget.is_none());
        assert!(config.circuit_breaker.is_none());
        assert!(config.retry.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff, BackoffKind::ExponentialJitter);
        assert_eq!(retry.base_delay, 1.0);
        assert_eq!(retry.max_delay, 60.0);
        assert!(retry.retryable.is_none());
    }

    #[test]
    fn breaker_defaults() {
        let cb = CircuitBreakerConfig::default();
        assert_eq!(cb.consecutive_failures, 10);
        assert_eq!(cb.open_duration, 30.0);
        assert_eq!(cb.half_open_max_calls, 1);
    }

    fn assert_rejects(config: ThrottleConfig, field: &str) {
        match config.validate() {
            Err(ThrottleError::InvalidConfig { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected InvalidConfig for {field}, got {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_range_fields() {
        assert_rejects(
            ThrottleConfig {
                max_concurrency: 0,
                ..Default::default()
            },
            "max_concurrency",
        );
        assert_rejects(
            ThrottleConfig {
                initial_concurrency: Some(6),
                ..Default::default()
            },
            "initial_concurrency",
        );
        assert_rejects(
            ThrottleConfig {
                initial_concurrency: Some(0),
                ..Default::default()
            },
            "initial_concurrency",
        );
        assert_rejects(
            ThrottleConfig {
                min_dispatch_interval: -0.1,
                ..Default::default()
            },
            "min_dispatch_interval",
        );
        assert_rejects(
            ThrottleConfig {
                max_dispatch_interval: 0.1,
                ..Default::default()
            },
            "max_dispatch_interval",
        );
        assert_rejects(
            ThrottleConfig {
                failure_threshold: 0,
                ..Default::default()
            },
            "failure_threshold",
        );
        assert_rejects(
            ThrottleConfig {
                failure_window: 0.0,
                ..Default::default()
            },
            "failure_window",
        );
        assert_rejects(
            ThrottleConfig {
                cooling_period: 0.0,
                ..Default::default()
            },
            "cooling_period",
        );
        assert_rejects(
            ThrottleConfig {
                safe_ceiling_decay_multiplier: 0.0,
                ..Default::default()
            },
            "safe_ceiling_decay_multiplier",
        );
        assert_rejects(
            ThrottleConfig {
                jitter_fraction: 1.5,
                ..Default::default()
            },
            "jitter_fraction",
        );
        assert_rejects(
            ThrottleConfig {
                token_budget: Some(TokenBudget {
                    max_tokens: 0,
                    window_seconds: 60.0,
                }),
                ..Default::default()
            },
            "token_budget.max_tokens",
        );
        assert_rejects(
            ThrottleConfig {
                circuit_breaker: Some(CircuitBreakerConfig {
                    consecutive_failures: 0,
                    ..Default::default()
                }),
                ..Default::default()
            },
            "circuit_breaker.consecutive_failures",
        );
        assert_rejects(
            ThrottleConfig {
                retry: Some(RetryConfig {
                    max_attempts: 0,
                    ..Default::default()
                }),
                ..Default::default()
            },
            "retry.max_attempts",
        );
        assert_rejects(
            ThrottleConfig {
                retry: Some(RetryConfig {
                    base_delay: 5.0,
                    max_delay: 1.0,
                    ..Default::default()
                }),
                ..Default::default()
            },
            "retry.max_delay",
        );
    }

    #[test]
    fn builder_sets_and_validates() {
        let config = ThrottleConfig::builder()
            .max_concurrency(10)
            .initial_concurrency(4)
            .min_dispatch_interval(0.0)
            .jitter_fraction(0.0)
            .total_tasks(100)
            .build()
            .unwrap();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.initial_concurrency, Some(4));
        assert_eq!(config.total_tasks, 100);

        let err = ThrottleConfig::builder()
            .max_concurrency(2)
            .initial_concurrency(3)
            .build()
            .unwrap_err();
        assert!(matches!(err, ThrottleError::InvalidConfig { .. }));
    }

    #[test]
    fn from_value_with_nested_sections() {
        let config = ThrottleConfig::from_value(json!({
            "max_concurrency": 8,
            "failure_threshold": 2,
            "token_budget": {"max_tokens": 1000, "window_seconds": 60.0},
            "circuit_breaker": {"consecutive_failures": 4},
            "retry": {"max_attempts": 5, "backoff": "fixed", "base_delay": 0.5, "max_delay": 2.0},
        }))
        .unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(
            config.token_budget,
            Some(TokenBudget {
                max_tokens: 1000,
                window_seconds: 60.0
            })
        );
        // Unspecified nested fields fall back to their defaults.
        assert_eq!(
            config.circuit_breaker,
            Some(CircuitBreakerConfig {
                consecutive_failures: 4,
                ..Default::default()
            })
        );
        let retry = config.retry.unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.backoff, BackoffKind::Fixed);
    }

    #[test]
    fn from_value_rejects_invalid() {
        let err = ThrottleConfig::from_value(json!({"max_concurrency": 0})).unwrap_err();
        assert!(matches!(err, ThrottleError::InvalidConfig { .. }));
    }

    #[test]
    fn value_round_trip_is_identity() {
        let config = ThrottleConfig::builder()
            .max_concurrency(7)
            .initial_concurrency(3)
            .min_dispatch_interval(0.1)
            .token_budget(TokenBudget {
                max_tokens: 500,
                window_seconds: 30.0,
            })
            .retry(RetryConfig {
                max_attempts: 4,
                backoff: BackoffKind::Exponential,
                base_delay: 0.25,
                max_delay: 8.0,
                retryable: None,
            })
            .build()
            .unwrap();

        let value = serde_json::to_value(&config).unwrap();
        let restored = ThrottleConfig::from_value(value.clone()).unwrap();
        assert_eq!(serde_json::to_value(&restored).unwrap(), value);
    }

    #[test]
    fn env_round_trip_is_identity() {
        let config = ThrottleConfig::builder()
            .max_concurrency(9)
            .initial_concurrency(2)
            .circuit_breaker(CircuitBreakerConfig {
                consecutive_failures: 3,
                open_duration: 15.0,
                half_open_max_calls: 2,
            })
            .retry(RetryConfig {
                max_attempts: 2,
                backoff: BackoffKind::Fixed,
                base_delay: 0.5,
                max_delay: 0.5,
                retryable: None,
            })
            .build()
            .unwrap();

        let restored =
            ThrottleConfig::from_env_iter("GENTLIFY", config.to_env_map("GENTLIFY")).unwrap();
        assert_eq!(
            serde_json::to_value(&restored).unwrap(),
            serde_json::to_value(&config).unwrap()
        );
    }

    #[test]
    fn from_env_reads_prefixed_variables() {
        let config = ThrottleConfig::from_env_iter(
            "APP",
            env(&[
                ("APP_MAX_CONCURRENCY", "12"),
                ("APP_MIN_DISPATCH_INTERVAL", "0.05"),
                ("APP_TOKEN_BUDGET_MAX", "2000"),
                ("APP_TOKEN_BUDGET_WINDOW", "90"),
                ("APP_CIRCUIT_BREAKER_OPEN_DURATION", "12.5"),
                ("GENTLIFY_MAX_CONCURRENCY", "99"),
            ]),
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 12);
        assert_eq!(config.min_dispatch_interval, 0.05);
        assert_eq!(
            config.token_budget,
            Some(TokenBudget {
                max_tokens: 2000,
                window_seconds: 90.0
            })
        );
        let cb = config.circuit_breaker.unwrap();
        assert_eq!(cb.open_duration, 12.5);
        assert_eq!(cb.consecutive_failures, 10);
    }

    #[test]
    fn from_env_reports_unparseable_values_by_variable() {
        let err = ThrottleConfig::from_env_iter(
            "GENTLIFY",
            env(&[("GENTLIFY_MAX_CONCURRENCY", "lots")]),
        )
        .unwrap_err();
        match err {
            ThrottleError::InvalidConfig { field, .. } => {
                assert_eq!(field, "GENTLIFY_MAX_CONCURRENCY");
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn from_env_rejects_partial_token_budget() {
        let err = ThrottleConfig::from_env_iter(
            "GENTLIFY",
            env(&[("GENTLIFY_TOKEN_BUDGET_MAX", "100")]),
        )
        .unwrap_err();
        assert!(matches!(err, ThrottleError::InvalidConfig { .. }));
    }

    #[test]
    fn backoff_kind_parses_and_displays() {
        for kind in [
            BackoffKind::Fixed,
            BackoffKind::Exponential,
            BackoffKind::ExponentialJitter,
        ] {
            assert_eq!(kind.to_string().parse::<BackoffKind>().unwrap(), kind);
        }
        assert!("quadratic".parse::<BackoffKind>().is_err());
    }
}
