use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, VigilError};
use crate::types::{ReviewMode, UnitState};

/// Top-level configuration loaded from `.vigil.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
///
/// # Examples
///
/// ```
/// use vigil_core::VigilConfig;
///
/// let config = VigilConfig::default();
/// assert_eq!(config.batch.worker_count, 3);
/// assert_eq!(config.retry.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// GitLab connection settings.
    #[serde(default)]
    pub gitlab: GitLabConfig,
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Retry and backoff settings shared by all dependencies.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-dependency circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Batch run defaults.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Pipeline (`vigil ci`) gating.
    #[serde(default)]
    pub ci: CiConfig,
}

impl VigilConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] if the file cannot be read, or
    /// [`VigilError::Toml`] if the content is not valid TOML.
    pub fn from_file(path: &Path) -> Result<Self, VigilError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::VigilConfig;
    ///
    /// let toml = r#"
    /// [batch]
    /// max_units = 25
    /// "#;
    /// let config = VigilConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.batch.max_units, 25);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, VigilError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Overlay `GITLAB_URL`, `GITLAB_TOKEN`, `LLM_API_KEY`, and the `CI_*`
    /// review settings from the environment.
    ///
    /// Unparseable `CI_*` values leave the configured value in place.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("GITLAB_URL") {
            self.gitlab.url = url;
        }
        if let Some(token) = lookup("GITLAB_TOKEN") {
            self.gitlab.token = Some(token);
        }
        if let Some(key) = lookup("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }

        let ci = &mut self.ci;
        if let Some(enabled) = lookup("CI_REVIEW_ENABLED") {
            ci.enabled = enabled.trim().eq_ignore_ascii_case("true");
        }
        if let Some(mode) = lookup("CI_REVIEW_TYPE").and_then(|m| m.parse().ok()) {
            ci.mode = mode;
        }
        if let Some(auto_post) = lookup("CI_AUTO_POST") {
            ci.auto_post = auto_post.trim().eq_ignore_ascii_case("true");
        }
        if let Some(draft) = lookup("CI_TRIGGER_ON_DRAFT") {
            ci.trigger_on_draft = draft.trim().eq_ignore_ascii_case("true");
        }
        let approvals = lookup("CI_REQUIRED_APPROVALS").and_then(|a| a.trim().parse().ok());
        if let Some(approvals) = approvals {
            ci.required_approvals = approvals;
        }
        if let Some(labels) = lookup("CI_REVIEW_ON_LABELS") {
            ci.review_on_labels = split_labels(&labels);
        }
        if let Some(labels) = lookup("CI_SKIP_ON_LABELS") {
            ci.skip_on_labels = split_labels(&labels);
        }
    }

    /// Check for values that would make a run meaningless.
    ///
    /// Returns one message per problem; an empty list means the config is usable.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::VigilConfig;
    ///
    /// let mut config = VigilConfig::default();
    /// assert!(config.validate().is_empty());
    ///
    /// config.retry.max_attempts = 0;
    /// assert_eq!(config.validate().len(), 1);
    /// ```
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        check_secs(&mut problems, "retry.base_delay_secs", self.retry.base_delay_secs);
        check_secs(&mut problems, "retry.max_delay_secs", self.retry.max_delay_secs);
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            problems.push("retry.max_delay_secs must be >= retry.base_delay_secs".to_string());
        }
        if !self.retry.exponential_base.is_finite() || self.retry.exponential_base < 1.0 {
            problems.push("retry.exponential_base must be a finite number >= 1.0".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        check_secs(
            &mut problems,
            "circuit_breaker.recovery_timeout_secs",
            self.circuit_breaker.recovery_timeout_secs,
        );
        if self.batch.max_units == 0 {
            problems.push("batch.max_units must be at least 1".to_string());
        }
        check_secs(
            &mut problems,
            "batch.inter_unit_delay_secs",
            self.batch.inter_unit_delay_secs,
        );
        problems
    }
}

fn split_labels(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(String::from)
        .collect()
}

/// Largest accepted value for any `*_secs` setting: one day.
pub const MAX_SECS: f64 = 86_400.0;

fn check_secs(problems: &mut Vec<String>, field: &str, value: f64) {
    if !value.is_finite() || value < 0.0 {
        problems.push(format!("{field} must be a finite, non-negative number"));
    } else if value > MAX_SECS {
        problems.push(format!("{field} must not exceed {MAX_SECS} seconds"));
    }
}

/// Convert user-supplied seconds, clamping negatives and NaN to zero and
/// anything too large for a [`Duration`] to [`Duration::MAX`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vigil_core::duration_from_secs;
///
/// assert_eq!(duration_from_secs(1.5), Duration::from_millis(1500));
/// assert_eq!(duration_from_secs(-3.0), Duration::ZERO);
/// assert_eq!(duration_from_secs(f64::INFINITY), Duration::MAX);
/// ```
pub fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// GitLab API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabConfig {
    /// Base URL of the GitLab instance.
    #[serde(default = "default_gitlab_url")]
    pub url: String,
    /// Personal or project access token.
    pub token: Option<String>,
    /// Per-request timeout in seconds (default: 30).
    #[serde(default = "default_gitlab_timeout")]
    pub timeout_secs: u64,
}

fn default_gitlab_url() -> String {
    "https://gitlab.com".into()
}

fn default_gitlab_timeout() -> u64 {
    30
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            url: default_gitlab_url(),
            token: None,
            timeout_secs: default_gitlab_timeout(),
        }
    }
}

/// LLM provider configuration.
///
/// # Examples
///
/// ```
/// use vigil_core::LlmConfig;
///
/// let config = LlmConfig::default();
/// assert_eq!(config.model, "gpt-4o");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name (e.g. `"openai"`, `"ollama"`).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Per-request timeout in seconds (default: 120).
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".into()
}

fn default_model() -> String {
    "gpt-4o".into()
}

fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// Retry and backoff configuration.
///
/// # Examples
///
/// ```
/// use vigil_core::RetryConfig;
///
/// let config = RetryConfig::default();
/// assert_eq!(config.retryable_status_codes, vec![429, 500, 502, 503, 504]);
/// assert!(config.jitter);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first call (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds (default: 1.0).
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,
    /// Upper bound on any single delay, in seconds (default: 60.0).
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    /// Growth factor between consecutive delays (default: 2.0).
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]` (default: true).
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// HTTP statuses worth retrying.
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
    /// Retry connection failures (default: true).
    #[serde(default = "default_true")]
    pub retry_on_connection: bool,
    /// Retry timeouts (default: true).
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

impl RetryConfig {
    /// Categories that are retried under this configuration, ignoring status codes.
    pub fn retryable_categories(&self) -> Vec<ErrorCategory> {
        let mut categories = Vec::new();
        if self.retry_on_connection {
            categories.push(ErrorCategory::Connection);
        }
        if self.retry_on_timeout {
            categories.push(ErrorCategory::Timeout);
        }
        categories
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter: true,
            retryable_status_codes: default_retryable_status_codes(),
            retry_on_connection: true,
            retry_on_timeout: true,
        }
    }
}

/// Circuit breaker configuration applied to every dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit (default: 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before a trial call (default: 60.0).
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> f64 {
    60.0
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a [`Duration`].
    pub fn recovery_timeout(&self) -> Duration {
        duration_from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

/// Defaults for a batch run.
///
/// # Examples
///
/// ```
/// use vigil_core::{BatchConfig, ReviewMode, UnitState};
///
/// let config = BatchConfig::default();
/// assert_eq!(config.mode, ReviewMode::General);
/// assert_eq!(config.state, UnitState::Opened);
/// assert_eq!(config.max_units, 10);
/// assert!(!config.publish);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Review focus (default: general).
    #[serde(default)]
    pub mode: ReviewMode,
    /// Merge-request state to enumerate (default: opened).
    #[serde(default)]
    pub state: UnitState,
    /// Maximum units per run (default: 10).
    #[serde(default = "default_max_units")]
    pub max_units: usize,
    /// Worker count; 1 or less runs sequentially (default: 3).
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Courtesy delay between units, in seconds (default: 1.0).
    #[serde(default = "default_inter_unit_delay")]
    pub inter_unit_delay_secs: f64,
    /// Publish generated reviews back to the source (default: false).
    #[serde(default)]
    pub publish: bool,
}

fn default_max_units() -> usize {
    10
}

fn default_worker_count() -> usize {
    3
}

fn default_inter_unit_delay() -> f64 {
    1.0
}

impl BatchConfig {
    /// Inter-unit delay as a [`Duration`].
    pub fn inter_unit_delay(&self) -> Duration {
        duration_from_secs(self.inter_unit_delay_secs)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: ReviewMode::default(),
            state: UnitState::default(),
            max_units: default_max_units(),
            worker_count: default_worker_count(),
            inter_unit_delay_secs: default_inter_unit_delay(),
            publish: false,
        }
    }
}

/// When a pipeline job should review its merge request.
///
/// # Examples
///
/// ```
/// use vigil_core::CiConfig;
///
/// let config = CiConfig::default();
/// assert!(config.enabled);
/// assert!(!config.auto_post);
/// assert_eq!(config.skip_on_labels, vec!["skip-review", "no-review"]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiConfig {
    /// Master switch (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Review focus (default: general).
    #[serde(default)]
    pub mode: ReviewMode,
    /// Post the review as a note (default: false).
    #[serde(default)]
    pub auto_post: bool,
    /// Review draft merge requests too (default: false).
    #[serde(default)]
    pub trigger_on_draft: bool,
    /// Upvotes required before reviewing (default: 0).
    #[serde(default)]
    pub required_approvals: u32,
    /// When non-empty, only merge requests carrying one of these labels are reviewed.
    #[serde(default)]
    pub review_on_labels: Vec<String>,
    /// Merge requests carrying any of these labels are skipped.
    #[serde(default = "default_skip_labels")]
    pub skip_on_labels: Vec<String>,
}

fn default_skip_labels() -> Vec<String> {
    vec!["skip-review".into(), "no-review".into()]
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ReviewMode::default(),
            auto_post: false,
            trigger_on_draft: false,
            required_approvals: 0,
            review_on_labels: Vec::new(),
            skip_on_labels: default_skip_labels(),
        }
    }
}
