use crate::error::ChargeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for the charge step.
///
/// `maximum_attempts` counts every invocation including the first one, so a policy
/// of 3 attempts yields the schedule `immediate -> initial_interval ->
/// initial_interval * backoff_coefficient` and never a fourth call.
///
/// Fields are private; a policy can only be obtained through [`RetryPolicy::new`] or
/// deserialization, both of which validate the bounds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RetryPolicyConfig", into = "RetryPolicyConfig")]
pub struct RetryPolicy {
    maximum_attempts: u32,
    initial_interval: Duration,
    backoff_coefficient: f64,
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    /// The policy the charge orchestration uses unless configured otherwise:
    /// 3 attempts, 5 seconds initial interval, doubling.
    pub const REFERENCE: Self = Self {
        maximum_attempts: 3,
        initial_interval: Duration::from_secs(5),
        backoff_coefficient: 2.0,
        maximum_interval: None,
    };

    /// Schedule the host uses for its own history reads and writes: 5 attempts,
    /// 200 ms doubling, at most 2 seconds apart.
    pub const HISTORY_ACCESS: Self = Self {
        maximum_attempts: 5,
        initial_interval: Duration::from_millis(200),
        backoff_coefficient: 2.0,
        maximum_interval: Some(Duration::from_secs(2)),
    };

    /// Single attempt, no retries.
    pub const NONE: Self = Self {
        maximum_attempts: 1,
        initial_interval: Duration::from_secs(0),
        backoff_coefficient: 1.0,
        maximum_interval: None,
    };

    pub fn new(
        maximum_attempts: u32,
        initial_interval: Duration,
        backoff_coefficient: f64,
    ) -> Result<Self, ChargeError> {
        if maximum_attempts < 1 {
            return Err(ChargeError::InvalidRetryPolicy(
                "maximum_attempts must be at least 1".to_string(),
            ));
        }
        if !backoff_coefficient.is_finite() || backoff_coefficient < 1.0 {
            return Err(ChargeError::InvalidRetryPolicy(format!(
                "backoff_coefficient must be a finite number >= 1.0, got {backoff_coefficient}"
            )));
        }
        Ok(Self {
            maximum_attempts,
            initial_interval,
            backoff_coefficient,
            maximum_interval: None,
        })
    }

    /// Caps every computed delay at `maximum_interval`.
    pub fn with_maximum_interval(mut self, maximum_interval: Duration) -> Result<Self, ChargeError> {
        if maximum_interval < self.initial_interval {
            return Err(ChargeError::InvalidRetryPolicy(
                "maximum_interval must not be shorter than initial_interval".to_string(),
            ));
        }
        self.maximum_interval = Some(maximum_interval);
        Ok(self)
    }

    pub fn maximum_attempts(&self) -> u32 {
        self.maximum_attempts
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn backoff_coefficient(&self) -> f64 {
        self.backoff_coefficient
    }

    pub fn maximum_interval(&self) -> Option<Duration> {
        self.maximum_interval
    }

    /// Delay to wait after attempt `attempt` (1-indexed) failed transiently.
    ///
    /// Returns `None` once `attempt` reaches `maximum_attempts`: the step is
    /// exhausted and must not be invoked again.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.maximum_attempts {
            return None;
        }

        let exponent = (attempt - 1) as i32;
        let delay_secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let delay_secs = match self.maximum_interval {
            Some(cap) => delay_secs.min(cap.as_secs_f64()),
            None => delay_secs,
        };

        // Very large coefficients overflow `Duration`; saturate instead of panicking.
        Some(Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// Loosely-typed form of a [`RetryPolicy`] as it appears in configuration files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub maximum_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    pub maximum_interval: Option<Duration>,
}

impl TryFrom<RetryPolicyConfig> for RetryPolicy {
    type Error = ChargeError;

    fn try_from(config: RetryPolicyConfig) -> Result<Self, Self::Error> {
        let policy = RetryPolicy::new(
            config.maximum_attempts,
            config.initial_interval,
            config.backoff_coefficient,
        )?;
        match config.maximum_interval {
            Some(cap) => policy.with_maximum_interval(cap),
            None => Ok(policy),
        }
    }
}

impl From<RetryPolicy> for RetryPolicyConfig {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            maximum_attempts: policy.maximum_attempts,
            initial_interval: policy.initial_interval,
            backoff_coefficient: policy.backoff_coefficient,
            maximum_interval: policy.maximum_interval,
        }
    }
}
