//! Per-unit pipeline: fetch, analyze, generate, and optionally publish.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vigil_core::{
    ImpactAnalysis, ReviewArtifact, ReviewMode, RiskLevel, UnitMetadata, UnitOfWork, UnitState,
    VigilError,
};
use vigil_resilience::{
    ErrorRecoveryManager, GracefulDegradationRegistry, RecoveryContext, ResilientInvoker,
};

use crate::collaborators::{Analyzer, GenerationRequest, Generator, SourceOfRecord};

/// Breaker name for calls to the [`SourceOfRecord`].
pub const SOURCE_DEPENDENCY: &str = "source_of_record";

/// Breaker name for calls to the [`Generator`].
pub const GENERATOR_DEPENDENCY: &str = "llm";

/// Operation and feature name of the generation step.
pub const REVIEW_GENERATION: &str = "review_generation";

/// Impact metrics carried into a [`UnitResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactSummary {
    /// Analyzer complexity score (0–100).
    pub complexity_score: u8,
    /// Risk classification reported by the review.
    pub risk: RiskLevel,
    /// Files analyzed.
    pub file_count: usize,
    /// Lines added.
    pub lines_added: usize,
    /// Lines removed.
    pub lines_removed: usize,
}

impl ImpactSummary {
    fn new(impact: &ImpactAnalysis, artifact: &ReviewArtifact) -> Self {
        Self {
            complexity_score: impact.complexity_score,
            risk: artifact.risk,
            file_count: impact.file_count,
            lines_added: impact.lines_added,
            lines_removed: impact.lines_removed,
        }
    }
}

/// Outcome of processing one unit. Exactly one is produced per unit.
///
/// # Examples
///
/// ```
/// use vigil_batch::processor::UnitResult;
/// use vigil_core::{ReviewMode, UnitMetadata, UnitOfWork};
///
/// let unit = UnitOfWork::new("group/app", UnitMetadata { id: 4, ..UnitMetadata::default() });
/// let result = UnitResult::failed(&unit, ReviewMode::General, "connection refused", 0.2);
/// assert!(!result.success);
/// assert_eq!(result.unit_id, 4);
/// assert!(result.impact.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitResult {
    /// Unit identifier.
    pub unit_id: u64,
    /// Collection the unit belongs to.
    pub collection_id: String,
    /// Review mode the unit was processed in.
    pub mode: ReviewMode,
    /// `true` if fetch, analysis, and generation all completed.
    pub success: bool,
    /// Wall time spent on the unit, in seconds.
    pub elapsed_secs: f64,
    /// Impact metrics; present on success.
    pub impact: Option<ImpactSummary>,
    /// Failure message; present on failure.
    pub error: Option<String>,
    /// `true` if the review was published.
    pub published: bool,
    /// `true` if the review came from a degraded or fallback path.
    #[serde(default)]
    pub fallback: bool,
    /// When the result was recorded.
    pub timestamp: DateTime<Utc>,
}

impl UnitResult {
    /// A failed result for `unit` with the given message.
    pub fn failed(
        unit: &UnitOfWork,
        mode: ReviewMode,
        error: impl Into<String>,
        elapsed_secs: f64,
    ) -> Self {
        Self {
            unit_id: unit.id,
            collection_id: unit.collection_id.clone(),
            mode,
            success: false,
            elapsed_secs,
            impact: None,
            error: Some(error.into()),
            published: false,
            fallback: false,
            timestamp: Utc::now(),
        }
    }
}

/// Runs the review pipeline for a single unit.
///
/// Every collaborator call goes through the shared [`ResilientInvoker`];
/// failures are recorded with the [`ErrorRecoveryManager`], which may turn
/// them into a recovered value. Generation additionally goes through the
/// `review_generation` feature when it is registered with the
/// [`GracefulDegradationRegistry`].
pub struct UnitProcessor {
    source: Arc<dyn SourceOfRecord>,
    analyzer: Arc<dyn Analyzer>,
    generator: Arc<dyn Generator>,
    invoker: Arc<ResilientInvoker>,
    recovery: Arc<ErrorRecoveryManager>,
    degradation: Arc<GracefulDegradationRegistry>,
}

impl UnitProcessor {
    /// Create a processor over the given collaborators and resilience components.
    pub fn new(
        source: Arc<dyn SourceOfRecord>,
        analyzer: Arc<dyn Analyzer>,
        generator: Arc<dyn Generator>,
        invoker: Arc<ResilientInvoker>,
        recovery: Arc<ErrorRecoveryManager>,
        degradation: Arc<GracefulDegradationRegistry>,
    ) -> Self {
        Self {
            source,
            analyzer,
            generator,
            invoker,
            recovery,
            degradation,
        }
    }

    /// The source of record units are fetched from.
    pub fn source(&self) -> &Arc<dyn SourceOfRecord> {
        &self.source
    }

    /// The invoker guarding collaborator calls.
    pub fn invoker(&self) -> &Arc<ResilientInvoker> {
        &self.invoker
    }

    /// The recovery manager holding this processor's error history.
    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.recovery
    }

    /// List candidate units through the invoker.
    ///
    /// # Errors
    ///
    /// Returns the source's error once retries are exhausted or the circuit is open.
    pub async fn list_units(
        &self,
        collection_id: &str,
        state: UnitState,
        max_count: usize,
    ) -> Result<Vec<UnitMetadata>, VigilError> {
        self.invoker
            .invoke(SOURCE_DEPENDENCY, || {
                self.source.list_units(collection_id, state, max_count)
            })
            .await
    }

    /// Look up a single unit through the invoker.
    ///
    /// # Errors
    ///
    /// Returns the source's error once retries are exhausted or the circuit is open.
    pub async fn fetch_unit(
        &self,
        collection_id: &str,
        unit_id: u64,
    ) -> Result<UnitOfWork, VigilError> {
        let metadata = self
            .invoker
            .invoke(SOURCE_DEPENDENCY, || {
                self.source.get_unit(collection_id, unit_id)
            })
            .await?;
        Ok(UnitOfWork::new(collection_id, metadata))
    }

    /// Process `unit` and return its result. Never fails: errors are captured
    /// in the returned [`UnitResult`].
    pub async fn process(&self, unit: &UnitOfWork, mode: ReviewMode, publish: bool) -> UnitResult {
        self.process_with_review(unit, mode, publish).await.0
    }

    /// Same as [`process`](Self::process), also handing back the review on success.
    pub async fn process_with_review(
        &self,
        unit: &UnitOfWork,
        mode: ReviewMode,
        publish: bool,
    ) -> (UnitResult, Option<ReviewArtifact>) {
        let started = Instant::now();
        info!(unit = unit.id, collection = %unit.collection_id, %mode, "processing unit");

        match self.review(unit, mode).await {
            Ok((impact, artifact)) => {
                let published = publish && self.publish(unit, &artifact).await;
                let elapsed_secs = started.elapsed().as_secs_f64();
                debug!(unit = unit.id, elapsed_secs, risk = %artifact.risk, "unit reviewed");
                let result = UnitResult {
                    unit_id: unit.id,
                    collection_id: unit.collection_id.clone(),
                    mode,
                    success: true,
                    elapsed_secs,
                    impact: Some(ImpactSummary::new(&impact, &artifact)),
                    error: None,
                    published,
                    fallback: artifact.fallback,
                    timestamp: Utc::now(),
                };
                (result, Some(artifact))
            }
            Err(e) => {
                error!(unit = unit.id, error = %e, "error processing unit");
                let elapsed_secs = started.elapsed().as_secs_f64();
                (UnitResult::failed(unit, mode, e.to_string(), elapsed_secs), None)
            }
        }
    }

    async fn review(
        &self,
        unit: &UnitOfWork,
        mode: ReviewMode,
    ) -> Result<(ImpactAnalysis, ReviewArtifact), VigilError> {
        let collection = unit.collection_id.as_str();
        let context = || {
            RecoveryContext::new(1, self.invoker.policy().max_attempts)
                .with_detail("unit_id", unit.id)
                .with_detail("collection_id", collection)
                .with_detail("mode", mode)
        };

        let changes = match self
            .invoker
            .invoke(SOURCE_DEPENDENCY, || {
                self.source.get_change_set(collection, unit.id)
            })
            .await
        {
            Ok(changes) => changes,
            Err(e) => self
                .recovery
                .handle(e, "fetch_change_set", SOURCE_DEPENDENCY, context())?,
        };

        let impact = match self.analyzer.analyze(&unit.metadata, &changes) {
            Ok(impact) => impact,
            Err(e) => self.recovery.handle(e, "analyze", "analyzer", context())?,
        };

        let request = GenerationRequest {
            metadata: unit.metadata.clone(),
            impact,
            mode,
        };
        let artifact = match self.generate(&request).await {
            Ok(artifact) => artifact,
            Err(e) => self
                .recovery
                .handle(e, REVIEW_GENERATION, "generator", context())?,
        };
        Ok((request.impact, artifact))
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ReviewArtifact, VigilError> {
        let primary = self
            .invoker
            .invoke(GENERATOR_DEPENDENCY, || self.generator.generate(request));
        if self.degradation.is_registered(REVIEW_GENERATION) {
            self.degradation
                .use_feature(REVIEW_GENERATION, request, primary)
                .await
        } else {
            primary.await
        }
    }

    /// Publish a non-empty review. Failures are logged and reported as `false`.
    async fn publish(&self, unit: &UnitOfWork, artifact: &ReviewArtifact) -> bool {
        if artifact.summary.trim().is_empty() {
            debug!(unit = unit.id, "empty summary, skipping publish");
            return false;
        }
        let text = self.generator.format_for_publish(artifact);
        let result = self
            .invoker
            .invoke(SOURCE_DEPENDENCY, || {
                self.source.publish(&unit.collection_id, unit.id, &text)
            })
            .await;
        match result {
            Ok(receipt) => {
                info!(unit = unit.id, note = receipt.id, "published review");
                true
            }
            Err(e) => {
                warn!(unit = unit.id, error = %e, "failed to publish review");
                false
            }
        }
    }
}

/// Register the built-in recovery handlers on `recovery`.
///
/// A failed `review_generation` becomes a placeholder artifact asking for a
/// manual review, with risk UNKNOWN. The unit still counts as processed.
pub fn register_default_fallbacks(recovery: &ErrorRecoveryManager) {
    recovery.register_fallback(REVIEW_GENERATION, |error, event| {
        let unit_id = event
            .details
            .get("unit_id")
            .and_then(|id| id.parse().ok())
            .unwrap_or_default();
        let mode = event
            .details
            .get("mode")
            .and_then(|m| m.parse().ok())
            .unwrap_or_default();
        Ok(manual_review_artifact(unit_id, mode, error))
    });
}

fn manual_review_artifact(unit_id: u64, mode: ReviewMode, error: &VigilError) -> ReviewArtifact {
    ReviewArtifact {
        unit_id,
        summary: "Automated review could not be generated; manual review required.".into(),
        detailed_comments: format!("Review generation failed: {error}"),
        recommendations: "Review this merge request manually.".into(),
        risk: RiskLevel::Unknown,
        mode,
        fallback: true,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use vigil_core::{
        ChangeSet, CircuitBreakerConfig, FileChange, PublishReceipt, UnitMetadata, UnitState,
    };
    use vigil_resilience::{RecoveryOutcome, RetryPolicy};

    #[derive(Default)]
    struct FakeSource {
        fetch_failures: AtomicU32,
        publish_fails: bool,
        published: Mutex<Vec<(u64, String)>>,
    }

    #[async_trait]
    impl SourceOfRecord for FakeSource {
        async fn list_units(
            &self,
            _collection_id: &str,
            _state: UnitState,
            _max_count: usize,
        ) -> Result<Vec<UnitMetadata>, VigilError> {
            Ok(Vec::new())
        }

        async fn get_unit(
            &self,
            _collection_id: &str,
            unit_id: u64,
        ) -> Result<UnitMetadata, VigilError> {
            Ok(UnitMetadata {
                id: unit_id,
                ..UnitMetadata::default()
            })
        }

        async fn get_change_set(
            &self,
            _collection_id: &str,
            unit_id: u64,
        ) -> Result<ChangeSet, VigilError> {
            if self.fetch_failures.load(Ordering::SeqCst) > 0 {
                self.fetch_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(VigilError::Connection("refused".into()));
            }
            Ok(ChangeSet {
                unit_id,
                changes: vec![FileChange {
                    new_path: "src/lib.rs".into(),
                    diff: "+fn a() {}\n".into(),
                    ..FileChange::default()
                }],
            })
        }

        async fn publish(
            &self,
            _collection_id: &str,
            unit_id: u64,
            text: &str,
        ) -> Result<PublishReceipt, VigilError> {
            if self.publish_fails {
                return Err(VigilError::Http {
                    status: 403,
                    message: "forbidden".into(),
                });
            }
            self.published.lock().unwrap().push((unit_id, text.to_string()));
            Ok(PublishReceipt { id: 99 })
        }
    }

    struct FixedAnalyzer;

    impl Analyzer for FixedAnalyzer {
        fn analyze(
            &self,
            _metadata: &UnitMetadata,
            changes: &ChangeSet,
        ) -> Result<ImpactAnalysis, VigilError> {
            Ok(ImpactAnalysis {
                file_count: changes.changes.len(),
                lines_added: 1,
                complexity_score: 30,
                ..ImpactAnalysis::default()
            })
        }
    }

    struct FakeGenerator {
        summary: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Generator for FakeGenerator {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<ReviewArtifact, VigilError> {
            if self.fail {
                return Err(VigilError::Http {
                    status: 400,
                    message: "bad prompt".into(),
                });
            }
            Ok(ReviewArtifact {
                unit_id: request.metadata.id,
                summary: self.summary.into(),
                detailed_comments: String::new(),
                recommendations: String::new(),
                risk: request.impact.risk_level(),
                mode: request.mode,
                fallback: false,
                generated_at: Utc::now(),
            })
        }

        fn format_for_publish(&self, artifact: &ReviewArtifact) -> String {
            format!("[{}] {}", artifact.risk, artifact.summary)
        }
    }

    fn processor(source: Arc<FakeSource>, generator: FakeGenerator) -> UnitProcessor {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        UnitProcessor::new(
            source,
            Arc::new(FixedAnalyzer),
            Arc::new(generator),
            Arc::new(ResilientInvoker::new(policy, CircuitBreakerConfig::default())),
            Arc::new(ErrorRecoveryManager::new()),
            Arc::new(GracefulDegradationRegistry::new()),
        )
    }

    fn unit(id: u64) -> UnitOfWork {
        UnitOfWork::new("group/app", UnitMetadata { id, ..UnitMetadata::default() })
    }

    #[tokio::test(start_paused = true)]
    async fn successful_unit_carries_impact() {
        let source = Arc::new(FakeSource::default());
        let p = processor(Arc::clone(&source), FakeGenerator { summary: "ok", fail: false });
        let result = p.process(&unit(1), ReviewMode::Security, false).await;
        assert!(result.success);
        assert_eq!(result.mode, ReviewMode::Security);
        let impact = result.impact.unwrap();
        assert_eq!(impact.complexity_score, 30);
        assert_eq!(impact.risk, RiskLevel::Low);
        assert_eq!(impact.file_count, 1);
        assert!(!result.published);
        assert!(source.published.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_fetch_failure_is_retried() {
        let source = Arc::new(FakeSource {
            fetch_failures: AtomicU32::new(2),
            ..FakeSource::default()
        });
        let p = processor(source, FakeGenerator { summary: "ok", fail: false });
        let result = p.process(&unit(2), ReviewMode::General, false).await;
        assert!(result.success, "{:?}", result.error);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_fetch_fails_the_unit() {
        let source = Arc::new(FakeSource {
            fetch_failures: AtomicU32::new(10),
            ..FakeSource::default()
        });
        let p = processor(source, FakeGenerator { summary: "ok", fail: false });
        let result = p.process(&unit(3), ReviewMode::General, true).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("refused"));
        assert!(!result.published);

        let history = p.recovery().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].operation, "fetch_change_set");
        assert_eq!(history[0].outcome, Some(RecoveryOutcome::NoneAvailable));
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_formatted_review() {
        let source = Arc::new(FakeSource::default());
        let generator = FakeGenerator {
            summary: "looks fine",
            fail: false,
        };
        let p = processor(Arc::clone(&source), generator);
        let result = p.process(&unit(4), ReviewMode::General, true).await;
        assert!(result.published);
        let published = source.published.lock().unwrap();
        assert_eq!(published.as_slice(), &[(4, "[LOW] looks fine".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_summary_is_not_published() {
        let source = Arc::new(FakeSource::default());
        let p = processor(Arc::clone(&source), FakeGenerator { summary: "  ", fail: false });
        let result = p.process(&unit(5), ReviewMode::General, true).await;
        assert!(result.success);
        assert!(!result.published);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_keeps_success() {
        let source = Arc::new(FakeSource {
            publish_fails: true,
            ..FakeSource::default()
        });
        let p = processor(source, FakeGenerator { summary: "ok", fail: false });
        let result = p.process(&unit(6), ReviewMode::General, true).await;
        assert!(result.success);
        assert!(!result.published);
        assert!(result.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn generation_failure_without_fallback_fails_unit() {
        let source = Arc::new(FakeSource::default());
        let p = processor(source, FakeGenerator { summary: "", fail: true });
        let result = p.process(&unit(7), ReviewMode::General, false).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("bad prompt"));
    }

    #[tokio::test(start_paused = true)]
    async fn default_fallback_yields_manual_review() {
        let source = Arc::new(FakeSource::default());
        let p = processor(source, FakeGenerator { summary: "", fail: true });
        register_default_fallbacks(p.recovery());
        let result = p.process(&unit(8), ReviewMode::Performance, false).await;
        assert!(result.success);
        assert!(result.fallback);
        assert_eq!(result.impact.unwrap().risk, RiskLevel::Unknown);
        assert_eq!(
            p.recovery().history()[0].outcome,
            Some(RecoveryOutcome::FallbackSucceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_generation_uses_substitute() {
        let source = Arc::new(FakeSource::default());
        let p = processor(source, FakeGenerator { summary: "llm", fail: false });
        p.degradation.register_degradable(
            REVIEW_GENERATION,
            || false,
            |request: &GenerationRequest| {
                Ok(ReviewArtifact {
                    unit_id: request.metadata.id,
                    summary: "heuristic".into(),
                    detailed_comments: String::new(),
                    recommendations: String::new(),
                    risk: RiskLevel::Medium,
                    mode: request.mode,
                    fallback: true,
                    generated_at: Utc::now(),
                })
            },
        );
        let result = p.process(&unit(9), ReviewMode::General, false).await;
        assert!(result.success);
        assert!(result.fallback);
        assert_eq!(result.impact.unwrap().risk, RiskLevel::Medium);
    }
}
