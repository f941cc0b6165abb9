use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};
use vigil_core::{CircuitBreakerConfig, VigilError};

/// State of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast until the recovery timeout elapses.
    Open,
    /// One trial call is allowed to test the dependency.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Point-in-time view of a breaker, for observability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive transient failures.
    pub failure_count: u32,
    /// Time since the last recorded failure, if any.
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Failure guard for one named dependency.
///
/// CLOSED counts consecutive transient failures and opens at
/// `failure_threshold`. OPEN rejects calls with [`VigilError::CircuitOpen`]
/// until `recovery_timeout` has passed since the last failure; the next call
/// then moves to HALF_OPEN and runs as the single trial. A successful trial
/// closes the circuit, a failed one re-opens it.
///
/// Errors that are not transient (see [`VigilError::is_transient`]) mean the
/// dependency answered, so they are recorded as successes.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vigil_core::VigilError;
/// use vigil_resilience::{CircuitBreaker, CircuitState};
///
/// # tokio_test_block_on(async {
/// let breaker = CircuitBreaker::new("gitlab", 1, Duration::from_secs(60));
/// let _ = breaker
///     .call(|| async { Err::<(), _>(VigilError::Connection("refused".into())) })
///     .await;
/// assert_eq!(breaker.state(), CircuitState::Open);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for the dependency `name`.
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Create a breaker from the `[circuit_breaker]` configuration section.
    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(name, config.failure_threshold, config.recovery_timeout())
    }

    /// Name of the guarded dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An expired OPEN state only moves on at the next call.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive transient failures recorded so far.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Returns `false` while a call would be rejected without running.
    ///
    /// An OPEN circuit whose recovery timeout has elapsed counts as
    /// permitting, since the next call becomes the half-open trial.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .last_failure
                .map_or(true, |t| t.elapsed() >= self.recovery_timeout),
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Snapshot for reporting.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            since_last_failure: inner.last_failure.map(|t| t.elapsed()),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// When the circuit is open the operation is not invoked at all.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::CircuitOpen`] when rejected, otherwise the
    /// operation's own error.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, VigilError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, VigilError>>,
    {
        let trial = self.acquire()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };
        let result = operation().await;
        match &result {
            Err(e) if e.is_transient() => self.on_failure(),
            _ => self.on_success(),
        }
        guard.armed = false;
        result
    }

    /// Admit a call. Returns `true` when the call is the half-open trial.
    fn acquire(&self) -> Result<bool, VigilError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let expired = inner
                    .last_failure
                    .map_or(true, |t| t.elapsed() >= self.recovery_timeout);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(
                        dependency = %self.name,
                        "circuit breaker half-open, allowing trial call"
                    );
                    Ok(true)
                } else {
                    Err(self.rejection())
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.rejection())
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            info!(dependency = %self.name, "circuit breaker closed, dependency recovered");
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;
        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            inner.state = CircuitState::Open;
            warn!(
                dependency = %self.name,
                failures = inner.failure_count,
                "circuit breaker opened"
            );
        }
    }

    fn rejection(&self) -> VigilError {
        VigilError::CircuitOpen {
            dependency: self.name.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the half-open trial slot if the call future is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}
