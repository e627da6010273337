use crate::core::{CoordError, Result};
use crate::transaction::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry behavior for optimistic write conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor applied after every failed attempt.
    pub multiplier: u32,
    /// Upper bound for a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay inserted after the failed attempt number `attempt` (1-based).
    ///
    /// With the defaults: 100ms after the first failure, 200ms after the
    /// second, and so on.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms.max(base);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }
}

/// Coordination layer configuration
///
/// Loadable from JSON:
///
/// ```
/// use coordb::CoordinationConfig;
///
/// let config = CoordinationConfig::from_json_str(
///     r#"{ "lock_timeout_ms": 5000, "retry": { "max_attempts": 5 } }"#,
/// ).unwrap();
/// assert_eq!(config.retry.max_attempts, 5);
/// assert_eq!(config.retry.base_delay_ms, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub retry: RetryPolicy,

    /// Bound on waiting for an entity-kind gate
    pub lock_timeout_ms: u64,

    /// Isolation for per-operation transactions
    pub isolation: IsolationLevel,

    /// Spawn a background drain when an operation is enqueued
    pub auto_drain: bool,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lock_timeout_ms: 30_000,
            isolation: IsolationLevel::RepeatableRead,
            auto_drain: true,
        }
    }
}

impl CoordinationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| CoordError::Config(format!("invalid configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            CoordError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the maximum number of attempts per operation
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    /// Set the base backoff delay
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.retry.base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the gate acquisition timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn auto_drain(mut self, enabled: bool) -> Self {
        self.auto_drain = enabled;
        self
    }

    pub fn lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(CoordError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier == 0 {
            return Err(CoordError::Config("retry.multiplier must be at least 1".into()));
        }
        if !self.isolation.is_serializable_equivalent() {
            return Err(CoordError::Config(format!(
                "isolation {} is weaker than repeatable read",
                self.isolation
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(CoordError::Config("lock_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
