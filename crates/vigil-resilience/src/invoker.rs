use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, warn};
use vigil_core::{CircuitBreakerConfig, VigilConfig, VigilError};

use crate::breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::retry::RetryPolicy;

/// Retry-with-backoff layered over one circuit breaker per named dependency.
///
/// Breakers are created lazily on first use and shared by every caller of the
/// same invoker, so concurrent workers see one consistent failure count.
///
/// # Examples
///
/// ```
/// use vigil_core::VigilError;
/// use vigil_resilience::{ResilientInvoker, RetryPolicy};
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let invoker = ResilientInvoker::new(RetryPolicy::no_retry(), Default::default());
/// let value = invoker.invoke("gitlab", || async { Ok::<_, VigilError>(3) }).await.unwrap();
/// assert_eq!(value, 3);
/// # });
/// ```
#[derive(Debug)]
pub struct ResilientInvoker {
    policy: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl ResilientInvoker {
    /// Create an invoker with the given retry policy and breaker settings.
    pub fn new(policy: RetryPolicy, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            policy,
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Create an invoker from the `[retry]` and `[circuit_breaker]` sections.
    pub fn from_config(config: &VigilConfig) -> Self {
        Self::new(
            RetryPolicy::from_config(&config.retry),
            config.circuit_breaker.clone(),
        )
    }

    /// The retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Resolve the breaker for `dependency`, creating it if needed.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(dependency.to_string())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::from_config(dependency, &self.breaker_config))
                }),
        )
    }

    /// State of the breaker for `dependency`; CLOSED if it was never used.
    pub fn circuit_state(&self, dependency: &str) -> CircuitState {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .get(dependency)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Whether a call to `dependency` would currently reach the operation.
    pub fn is_call_permitted(&self, dependency: &str) -> bool {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .get(dependency)
            .map_or(true, |b| b.is_call_permitted())
    }

    /// Snapshots of every known breaker, keyed by dependency name.
    pub fn snapshots(&self) -> BTreeMap<String, CircuitSnapshot> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.snapshot()))
            .collect()
    }

    /// Call `operation` through the dependency's breaker, retrying with backoff.
    ///
    /// Each attempt invokes `operation` exactly once. Retryable errors are
    /// retried until `max_attempts` is reached; anything else, including an
    /// open circuit, propagates immediately. On exhaustion the last error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the final error produced by the operation or the breaker.
    pub async fn invoke<T, F, Fut>(
        &self,
        dependency: &str,
        mut operation: F,
    ) -> Result<T, VigilError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VigilError>>,
    {
        let breaker = self.breaker(dependency);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match breaker.call(|| operation()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(dependency, attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !self.policy.is_retryable(&e) {
                        debug!(dependency, attempt, error = %e, "non-retryable failure");
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        error!(dependency, attempts = attempt, error = %e, "retries exhausted");
                        return Err(e);
                    }
                    let delay = self.policy.delay(attempt);
                    warn!(
                        dependency,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
