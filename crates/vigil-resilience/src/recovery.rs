use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use vigil_core::{ErrorCategory, VigilError};

/// How an error event was ultimately dealt with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryOutcome {
    /// A category strategy produced a value.
    StrategySucceeded,
    /// A category strategy ran and failed.
    StrategyFailed,
    /// An operation fallback produced a value.
    FallbackSucceeded,
    /// An operation fallback ran and failed.
    FallbackFailed,
    /// Nothing recovered the error; it was re-raised.
    NoneAvailable,
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryOutcome::StrategySucceeded => "strategy-succeeded",
            RecoveryOutcome::StrategyFailed => "strategy-failed",
            RecoveryOutcome::FallbackSucceeded => "fallback-succeeded",
            RecoveryOutcome::FallbackFailed => "fallback-failed",
            RecoveryOutcome::NoneAvailable => "none-available",
        };
        f.write_str(name)
    }
}

/// Extra information about the failing call.
///
/// # Examples
///
/// ```
/// use vigil_resilience::RecoveryContext;
///
/// let ctx = RecoveryContext::new(2, 3).with_detail("unit_id", "42");
/// assert_eq!(ctx.details["unit_id"], "42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryContext {
    /// Attempt that produced the error.
    pub attempt: u32,
    /// Attempts that were allowed.
    pub max_attempts: u32,
    /// Free-form key/value details passed through to handlers.
    pub details: BTreeMap<String, String>,
}

impl RecoveryContext {
    /// Context for attempt `attempt` of `max_attempts`.
    pub fn new(attempt: u32, max_attempts: u32) -> Self {
        Self {
            attempt,
            max_attempts,
            details: BTreeMap::new(),
        }
    }

    /// Attach a detail visible to recovery handlers.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

impl Default for RecoveryContext {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// One recorded error occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    /// Sequence number within the owning manager.
    pub id: u64,
    /// Logical operation that failed (e.g. `review_generation`).
    pub operation: String,
    /// Component that raised the error (e.g. `generator`).
    pub component: String,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// Attempt that produced the error.
    pub attempt: u32,
    /// Attempts that were allowed.
    pub max_attempts: u32,
    /// Error classification.
    pub category: ErrorCategory,
    /// Error message.
    pub message: String,
    /// Details passed by the caller.
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    /// How the error was dealt with, once known.
    pub outcome: Option<RecoveryOutcome>,
}

impl ErrorEvent {
    /// Build an event for `error`, timestamped now.
    pub fn new(
        error: &VigilError,
        operation: impl Into<String>,
        component: impl Into<String>,
        context: &RecoveryContext,
    ) -> Self {
        Self {
            id: 0,
            operation: operation.into(),
            component: component.into(),
            timestamp: Utc::now(),
            attempt: context.attempt,
            max_attempts: context.max_attempts,
            category: error.category(),
            message: error.to_string(),
            details: context.details.clone(),
            outcome: None,
        }
    }
}

/// Aggregated view over the error history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStatistics {
    /// Events currently in history.
    pub total_errors: usize,
    /// Events recorded within the last hour.
    pub recent_errors: usize,
    /// Counts keyed by error category.
    pub by_category: BTreeMap<String, usize>,
    /// Counts keyed by component.
    pub by_component: BTreeMap<String, usize>,
    /// Counts keyed by operation.
    pub by_operation: BTreeMap<String, usize>,
    /// Counts keyed by recovery outcome.
    pub by_outcome: BTreeMap<String, usize>,
}

/// A recovery strategy or fallback producing a `T`.
pub type RecoveryHandler<T> =
    Arc<dyn Fn(&VigilError, &ErrorEvent) -> Result<T, VigilError> + Send + Sync>;

type HandlerSlot = Box<dyn Any + Send + Sync>;

/// Records error events and applies registered recovery strategies, then fallbacks.
///
/// Strategies are keyed by [`ErrorCategory`], fallbacks by operation name. Both
/// are typed by the value they recover to, so a handler registered for a
/// `ReviewArtifact` never answers a call expecting something else.
///
/// # Examples
///
/// ```
/// use vigil_core::{ErrorCategory, VigilError};
/// use vigil_resilience::{ErrorRecoveryManager, RecoveryContext, RecoveryOutcome};
///
/// let manager = ErrorRecoveryManager::new();
/// manager.register_strategy(ErrorCategory::Timeout, |_err, _event| Ok(0_u32));
///
/// let value: u32 = manager
///     .handle(VigilError::Timeout("slow".into()), "fetch", "gitlab", RecoveryContext::default())
///     .unwrap();
/// assert_eq!(value, 0);
/// assert_eq!(manager.history()[0].outcome, Some(RecoveryOutcome::StrategySucceeded));
/// ```
#[derive(Default)]
pub struct ErrorRecoveryManager {
    history: Mutex<Vec<ErrorEvent>>,
    next_id: AtomicU64,
    strategies: RwLock<HashMap<(ErrorCategory, TypeId), HandlerSlot>>,
    fallbacks: RwLock<HashMap<(String, TypeId), HandlerSlot>>,
}

impl fmt::Debug for ErrorRecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRecoveryManager")
            .field("events", &self.lock_history().len())
            .finish_non_exhaustive()
    }
}

impl ErrorRecoveryManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recovery strategy for errors of `category` recovering to `T`.
    ///
    /// Replaces any strategy previously registered for the same pair.
    pub fn register_strategy<T, F>(&self, category: ErrorCategory, strategy: F)
    where
        T: 'static,
        F: Fn(&VigilError, &ErrorEvent) -> Result<T, VigilError> + Send + Sync + 'static,
    {
        let handler: RecoveryHandler<T> = Arc::new(strategy);
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((category, TypeId::of::<T>()), Box::new(handler));
        info!(%category, "registered recovery strategy");
    }

    /// Register a fallback for `operation` recovering to `T`.
    pub fn register_fallback<T, F>(&self, operation: impl Into<String>, fallback: F)
    where
        T: 'static,
        F: Fn(&VigilError, &ErrorEvent) -> Result<T, VigilError> + Send + Sync + 'static,
    {
        let operation = operation.into();
        let handler: RecoveryHandler<T> = Arc::new(fallback);
        info!(operation = %operation, "registered fallback handler");
        self.fallbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((operation, TypeId::of::<T>()), Box::new(handler));
    }

    /// Record `error` and try to recover a `T` from it.
    ///
    /// Runs the category strategy first, then the operation fallback. The
    /// first handler to succeed wins and its value is returned.
    ///
    /// # Errors
    ///
    /// Returns the original `error` when no handler exists or every handler
    /// failed; the recorded event's outcome is then `none-available`.
    pub fn handle<T: 'static>(
        &self,
        error: VigilError,
        operation: &str,
        component: &str,
        context: RecoveryContext,
    ) -> Result<T, VigilError> {
        let event = self.record(ErrorEvent::new(&error, operation, component, &context));
        let category = event.category;

        if let Some(strategy) = self.strategy::<T>(category) {
            info!(%category, operation, "attempting recovery strategy");
            match strategy(&error, &event) {
                Ok(value) => {
                    self.set_outcome(event.id, RecoveryOutcome::StrategySucceeded);
                    return Ok(value);
                }
                Err(e) => {
                    warn!(%category, operation, error = %e, "recovery strategy failed");
                    self.set_outcome(event.id, RecoveryOutcome::StrategyFailed);
                }
            }
        }

        if let Some(fallback) = self.fallback::<T>(operation) {
            info!(operation, "using fallback");
            match fallback(&error, &event) {
                Ok(value) => {
                    self.set_outcome(event.id, RecoveryOutcome::FallbackSucceeded);
                    return Ok(value);
                }
                Err(e) => {
                    warn!(operation, error = %e, "fallback handler failed");
                    self.set_outcome(event.id, RecoveryOutcome::FallbackFailed);
                }
            }
        }

        self.set_outcome(event.id, RecoveryOutcome::NoneAvailable);
        error!(operation, component, error = %error, "no recovery available");
        Err(error)
    }

    /// Append an event to the history, assigning it a sequence number.
    ///
    /// Returns the stored event.
    pub fn record(&self, mut event: ErrorEvent) -> ErrorEvent {
        event.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_history().push(event.clone());
        event
    }

    /// Copy of the current history, oldest first.
    pub fn history(&self) -> Vec<ErrorEvent> {
        self.lock_history().clone()
    }

    /// Counts by category, component, operation and outcome, plus the last-hour count.
    pub fn statistics(&self) -> ErrorStatistics {
        let history = self.lock_history();
        let cutoff = Utc::now() - ChronoDuration::hours(1);
        let mut stats = ErrorStatistics {
            total_errors: history.len(),
            ..ErrorStatistics::default()
        };
        for event in history.iter() {
            *stats.by_category.entry(event.category.to_string()).or_default() += 1;
            *stats.by_component.entry(event.component.clone()).or_default() += 1;
            *stats.by_operation.entry(event.operation.clone()).or_default() += 1;
            if let Some(outcome) = event.outcome {
                *stats.by_outcome.entry(outcome.to_string()).or_default() += 1;
            }
            if event.timestamp > cutoff {
                stats.recent_errors += 1;
            }
        }
        stats
    }

    /// Drop events older than `max_age`. Returns how many were removed.
    pub fn cleanup(&self, max_age: ChronoDuration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut history = self.lock_history();
        let before = history.len();
        history.retain(|event| event.timestamp >= cutoff);
        let removed = before - history.len();
        if removed > 0 {
            info!(removed, "cleaned up old error records");
        }
        removed
    }

    fn strategy<T: 'static>(&self, category: ErrorCategory) -> Option<RecoveryHandler<T>> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(category, TypeId::of::<T>()))
            .and_then(|slot| slot.downcast_ref::<RecoveryHandler<T>>())
            .cloned()
    }

    fn fallback<T: 'static>(&self, operation: &str) -> Option<RecoveryHandler<T>> {
        self.fallbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(operation.to_string(), TypeId::of::<T>()))
            .and_then(|slot| slot.downcast_ref::<RecoveryHandler<T>>())
            .cloned()
    }

    fn set_outcome(&self, id: u64, outcome: RecoveryOutcome) {
        let mut history = self.lock_history();
        if let Some(event) = history.iter_mut().rev().find(|e| e.id == id) {
            event.outcome = Some(outcome);
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<ErrorEvent>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> VigilError {
        VigilError::Timeout("deadline exceeded".into())
    }

    fn last_outcome(manager: &ErrorRecoveryManager) -> Option<RecoveryOutcome> {
        manager.history().last().and_then(|e| e.outcome)
    }

    #[test]
    fn strategy_value_is_returned() {
        let manager = ErrorRecoveryManager::new();
        manager.register_strategy(ErrorCategory::Timeout, |_, _| Ok("recovered".to_string()));
        let value: String = manager
            .handle(timeout(), "fetch", "gitlab", RecoveryContext::default())
            .unwrap();
        assert_eq!(value, "recovered");
        assert_eq!(last_outcome(&manager), Some(RecoveryOutcome::StrategySucceeded));
    }

    #[test]
    fn fallback_runs_after_failed_strategy() {
        let manager = ErrorRecoveryManager::new();
        manager.register_strategy::<u32, _>(ErrorCategory::Timeout, |_, _| {
            Err(VigilError::Config("strategy broke".into()))
        });
        manager.register_fallback("fetch", |_, _| Ok(9_u32));
        let value: u32 = manager
            .handle(timeout(), "fetch", "gitlab", RecoveryContext::default())
            .unwrap();
        assert_eq!(value, 9);
        assert_eq!(last_outcome(&manager), Some(RecoveryOutcome::FallbackSucceeded));
    }

    #[test]
    fn original_error_reraised_when_everything_fails() {
        let manager = ErrorRecoveryManager::new();
        manager.register_strategy::<u32, _>(ErrorCategory::Timeout, |_, _| {
            Err(VigilError::Config("strategy broke".into()))
        });
        manager.register_fallback::<u32, _>("fetch", |_, _| {
            Err(VigilError::Config("fallback broke".into()))
        });
        let err = manager
            .handle::<u32>(timeout(), "fetch", "gitlab", RecoveryContext::default())
            .unwrap_err();
        assert!(matches!(err, VigilError::Timeout(_)));
        assert_eq!(last_outcome(&manager), Some(RecoveryOutcome::NoneAvailable));
    }

    #[test]
    fn unregistered_error_is_reraised() {
        let manager = ErrorRecoveryManager::new();
        let err = manager
            .handle::<()>(
                VigilError::Connection("refused".into()),
                "list_units",
                "gitlab",
                RecoveryContext::default(),
            )
            .unwrap_err();
        assert!(matches!(err, VigilError::Connection(_)));
        assert_eq!(manager.history().len(), 1);
        assert_eq!(last_outcome(&manager), Some(RecoveryOutcome::NoneAvailable));
    }

    #[test]
    fn handlers_are_typed() {
        let manager = ErrorRecoveryManager::new();
        manager.register_fallback("fetch", |_, _| Ok(1_u32));
        let result =
            manager.handle::<String>(timeout(), "fetch", "gitlab", RecoveryContext::default());
        assert!(result.is_err());
    }

    #[test]
    fn handler_sees_event_details() {
        let manager = ErrorRecoveryManager::new();
        manager.register_fallback("review_generation", |_, event: &ErrorEvent| {
            Ok(event.details.get("unit_id").cloned().unwrap_or_default())
        });
        let ctx = RecoveryContext::new(1, 3).with_detail("unit_id", 17);
        let value: String = manager
            .handle(timeout(), "review_generation", "generator", ctx)
            .unwrap();
        assert_eq!(value, "17");
        let event = &manager.history()[0];
        assert_eq!(event.attempt, 1);
        assert_eq!(event.max_attempts, 3);
        assert_eq!(event.category, ErrorCategory::Timeout);
    }

    #[test]
    fn statistics_count_each_dimension() {
        let manager = ErrorRecoveryManager::new();
        manager.register_fallback("generate", |_, _| Ok(()));
        let _ = manager.handle::<()>(timeout(), "generate", "llm", RecoveryContext::default());
        let _ = manager.handle::<()>(timeout(), "fetch", "gitlab", RecoveryContext::default());
        let _ = manager.handle::<()>(
            VigilError::Connection("refused".into()),
            "fetch",
            "gitlab",
            RecoveryContext::default(),
        );

        let stats = manager.statistics();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.recent_errors, 3);
        assert_eq!(stats.by_category["timeout"], 2);
        assert_eq!(stats.by_category["connection"], 1);
        assert_eq!(stats.by_component["gitlab"], 2);
        assert_eq!(stats.by_operation["generate"], 1);
        assert_eq!(stats.by_outcome["fallback-succeeded"], 1);
        assert_eq!(stats.by_outcome["none-available"], 2);
    }

    #[test]
    fn empty_statistics_are_zeroed() {
        let stats = ErrorRecoveryManager::new().statistics();
        assert_eq!(stats, ErrorStatistics::default());
    }

    #[test]
    fn cleanup_removes_only_old_events() {
        let manager = ErrorRecoveryManager::new();
        let mut old = ErrorEvent::new(&timeout(), "fetch", "gitlab", &RecoveryContext::default());
        old.timestamp = Utc::now() - ChronoDuration::hours(25);
        manager.record(old);
        let recent = manager.record(ErrorEvent::new(
            &timeout(),
            "fetch",
            "gitlab",
            &RecoveryContext::default(),
        ));

        let removed = manager.cleanup(ChronoDuration::hours(24));
        assert_eq!(removed, 1);
        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, recent.id);

        let stats = manager.statistics();
        assert_eq!(stats.total_errors, 1);
    }

    #[test]
    fn recent_count_excludes_events_older_than_an_hour() {
        let manager = ErrorRecoveryManager::new();
        let mut stale = ErrorEvent::new(&timeout(), "fetch", "gitlab", &RecoveryContext::default());
        stale.timestamp = Utc::now() - ChronoDuration::minutes(90);
        manager.record(stale);
        manager.record(ErrorEvent::new(
            &timeout(),
            "fetch",
            "gitlab",
            &RecoveryContext::default(),
        ));
        let stats = manager.statistics();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.recent_errors, 1);
    }

    #[test]
    fn outcome_names_match_wire_format() {
        let json = serde_json::to_string(&RecoveryOutcome::NoneAvailable).unwrap();
        assert_eq!(json, "\"none-available\"");
        assert_eq!(RecoveryOutcome::StrategyFailed.to_string(), "strategy-failed");
    }
}
