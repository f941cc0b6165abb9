use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use vigil_core::VigilError;

/// Health predicate for a feature.
pub type HealthCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Reduced-functionality replacement for a feature, computed from the call input.
pub type Substitute<I, T> = Arc<dyn Fn(&I) -> Result<T, VigilError> + Send + Sync>;

/// Cached health of one feature.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureHealth {
    /// Result of the last health check (`true` before any check).
    pub healthy: bool,
    /// Consecutive failed health checks.
    pub consecutive_failures: u32,
    /// When the health check last ran.
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for FeatureHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_check: None,
        }
    }
}

/// Aggregate health across all registered features.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    /// Fraction of healthy features; `1.0` when nothing is registered.
    pub overall_health: f64,
    /// Features whose cached state is healthy.
    pub healthy_features: usize,
    /// Registered features.
    pub total_features: usize,
    /// Per-feature cached state.
    pub features: BTreeMap<String, FeatureHealth>,
}

struct Feature {
    check: HealthCheck,
    substitute: Option<Box<dyn Any + Send + Sync>>,
    health: FeatureHealth,
}

/// Tracks feature health and swaps in degraded behavior when a feature is down.
///
/// The registry is an ordinary value: construct one per run (or per test) and
/// pass it to whoever needs it.
///
/// # Examples
///
/// ```
/// use vigil_core::VigilError;
/// use vigil_resilience::GracefulDegradationRegistry;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let registry = GracefulDegradationRegistry::new();
/// registry.register_degradable("summaries", || false, |input: &String| {
///     Ok(format!("short: {input}"))
/// });
///
/// let text = registry
///     .use_feature("summaries", &"diff".to_string(), async {
///         Ok::<_, VigilError>("full".to_string())
///     })
///     .await
///     .unwrap();
/// assert_eq!(text, "short: diff");
/// # });
/// ```
#[derive(Default)]
pub struct GracefulDegradationRegistry {
    features: Mutex<HashMap<String, Feature>>,
}

impl fmt::Debug for GracefulDegradationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let features = self.lock();
        let mut names: Vec<_> = features.keys().collect();
        names.sort();
        f.debug_struct("GracefulDegradationRegistry")
            .field("features", &names)
            .finish()
    }
}

impl GracefulDegradationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feature with a health check and no degraded mode.
    pub fn register_feature<C>(&self, name: impl Into<String>, check: C)
    where
        C: Fn() -> bool + Send + Sync + 'static,
    {
        self.insert(name.into(), Arc::new(check), None);
    }

    /// Register a feature with a health check and a substitute used while unhealthy.
    ///
    /// The substitute receives the same input the caller passes to
    /// [`use_feature`](Self::use_feature) and must produce the same output type.
    pub fn register_degradable<I, T, C, S>(&self, name: impl Into<String>, check: C, substitute: S)
    where
        I: 'static,
        T: 'static,
        C: Fn() -> bool + Send + Sync + 'static,
        S: Fn(&I) -> Result<T, VigilError> + Send + Sync + 'static,
    {
        let substitute: Substitute<I, T> = Arc::new(substitute);
        self.insert(name.into(), Arc::new(check), Some(Box::new(substitute)));
    }

    /// Returns `true` if `name` was registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Run the feature's health check and refresh its cached state.
    ///
    /// Unregistered features are reported unhealthy.
    pub fn check_health(&self, name: &str) -> bool {
        let check = match self.lock().get(name) {
            Some(feature) => Arc::clone(&feature.check),
            None => return false,
        };
        // Run the predicate unlocked; it may consult other shared state.
        let healthy = check();

        let mut features = self.lock();
        if let Some(feature) = features.get_mut(name) {
            feature.health.healthy = healthy;
            feature.health.last_check = Some(Utc::now());
            if healthy {
                feature.health.consecutive_failures = 0;
            } else {
                feature.health.consecutive_failures += 1;
                debug!(
                    feature = name,
                    failures = feature.health.consecutive_failures,
                    "health check failed"
                );
            }
        }
        healthy
    }

    /// Cached health of `name`, without running its check.
    pub fn health(&self, name: &str) -> Option<FeatureHealth> {
        self.lock().get(name).map(|f| f.health.clone())
    }

    /// Run `primary` if the feature is healthy, otherwise its substitute on `input`.
    ///
    /// `primary` is only polled on the healthy path.
    ///
    /// # Errors
    ///
    /// - [`VigilError::Config`] if `name` was never registered.
    /// - [`VigilError::FeatureUnavailable`] if it is unhealthy and has no
    ///   substitute for `I -> T`.
    /// - Whatever `primary` or the substitute returns.
    pub async fn use_feature<I, T, Fut>(
        &self,
        name: &str,
        input: &I,
        primary: Fut,
    ) -> Result<T, VigilError>
    where
        I: 'static,
        T: 'static,
        Fut: Future<Output = Result<T, VigilError>>,
    {
        if !self.is_registered(name) {
            return Err(VigilError::Config(format!("feature {name} not registered")));
        }
        if self.check_health(name) {
            return primary.await;
        }

        let substitute = self.lock().get(name).and_then(|feature| {
            feature
                .substitute
                .as_ref()
                .and_then(|s| s.downcast_ref::<Substitute<I, T>>())
                .cloned()
        });
        match substitute {
            Some(substitute) => {
                info!(feature = name, "using degraded mode");
                substitute(input)
            }
            None => {
                warn!(feature = name, "feature unavailable without degraded mode");
                Err(VigilError::FeatureUnavailable {
                    feature: name.to_string(),
                })
            }
        }
    }

    /// Healthy fraction and per-feature state, from cached values.
    pub fn system_health(&self) -> SystemHealth {
        let features = self.lock();
        let total_features = features.len();
        let healthy_features = features.values().filter(|f| f.health.healthy).count();
        let overall_health = if total_features == 0 {
            1.0
        } else {
            healthy_features as f64 / total_features as f64
        };
        SystemHealth {
            overall_health,
            healthy_features,
            total_features,
            features: features
                .iter()
                .map(|(name, f)| (name.clone(), f.health.clone()))
                .collect(),
        }
    }

    fn insert(
        &self,
        name: String,
        check: HealthCheck,
        substitute: Option<Box<dyn Any + Send + Sync>>,
    ) {
        info!(feature = %name, degradable = substitute.is_some(), "registered feature");
        self.lock().insert(
            name,
            Feature {
                check,
                substitute,
                health: FeatureHealth::default(),
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Feature>> {
        self.features.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
