//! Fault-tolerance primitives for calls to external dependencies.
//!
//! - [`RetryPolicy`]: exponential backoff with optional jitter and retry eligibility
//! - [`CircuitBreaker`]: per-dependency CLOSED / OPEN / HALF_OPEN guard
//! - [`ResilientInvoker`]: retry layered over one breaker per named dependency
//! - [`ErrorRecoveryManager`]: error history plus category strategies and operation fallbacks
//! - [`GracefulDegradationRegistry`]: feature health with degraded substitutes
//!
//! Every component is an ordinary value; nothing here is process-global.

mod breaker;
mod degradation;
mod invoker;
mod recovery;
mod retry;

pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use degradation::{
    FeatureHealth, GracefulDegradationRegistry, HealthCheck, Substitute, SystemHealth,
};
pub use invoker::ResilientInvoker;
pub use recovery::{
    ErrorEvent, ErrorRecoveryManager, ErrorStatistics, RecoveryContext, RecoveryHandler,
    RecoveryOutcome,
};
pub use retry::RetryPolicy;
