use std::time::Duration;

use rand::Rng;
use vigil_core::{duration_from_secs, ErrorCategory, RetryConfig, VigilError};

/// Exponential backoff and retry-eligibility rules.
///
/// Stateless: a single policy can be shared by any number of concurrent callers.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vigil_resilience::RetryPolicy;
///
/// let policy = RetryPolicy {
///     base_delay: Duration::from_secs(1),
///     max_delay: Duration::from_secs(5),
///     jitter: false,
///     ..RetryPolicy::default()
/// };
/// assert_eq!(policy.delay(1), Duration::from_secs(1));
/// assert_eq!(policy.delay(3), Duration::from_secs(4));
/// assert_eq!(policy.delay(10), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
    /// Scale each delay by a uniform factor in `[0.5, 1.0]`.
    pub jitter: bool,
    /// HTTP statuses that are retried.
    pub retryable_status_codes: Vec<u16>,
    /// Non-HTTP categories that are retried.
    pub retryable_categories: Vec<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from the `[retry]` configuration section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: duration_from_secs(config.base_delay_secs),
            max_delay: duration_from_secs(config.max_delay_secs),
            exponential_base: config.exponential_base.max(1.0),
            jitter: config.jitter,
            retryable_status_codes: config.retryable_status_codes.clone(),
            retryable_categories: config.retryable_categories(),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    ///
    /// `min(base_delay * exponential_base^(attempt-1), max_delay)`; non-decreasing
    /// in `attempt` and never above `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        duration_from_secs(capped)
    }

    /// Backoff before retry number `attempt`, with jitter applied when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter {
            return nominal;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        duration_from_secs(nominal.as_secs_f64() * factor)
    }

    /// Returns `true` if `error` belongs to a retryable category or status.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::VigilError;
    /// use vigil_resilience::RetryPolicy;
    ///
    /// let policy = RetryPolicy::default();
    /// assert!(policy.is_retryable(&VigilError::Http { status: 503, message: String::new() }));
    /// assert!(!policy.is_retryable(&VigilError::Http { status: 404, message: String::new() }));
    /// ```
    pub fn is_retryable(&self, error: &VigilError) -> bool {
        if let Some(status) = error.status() {
            return self.retryable_status_codes.contains(&status);
        }
        self.retryable_categories.contains(&error.category())
    }
}
