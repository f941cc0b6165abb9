//! Batch runs: enumerate, filter, dispatch, and summarize.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use vigil_core::{BatchConfig, ReviewMode, UnitOfWork, UnitState, VigilError};

use crate::analytics::{AnalyticsAggregator, AnalyticsReport};
use crate::export::{export_results, ExportFormat};
use crate::filter::UnitFilter;
use crate::processor::{UnitProcessor, UnitResult};

/// Upper bound on candidates requested from the source per run.
const MAX_CANDIDATES: usize = 100;

/// Progress hook: `(completed, total, message)`.
///
/// May be called from several tasks; keep it cheap.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Parameters of one batch run.
///
/// # Examples
///
/// ```
/// use vigil_batch::coordinator::BatchRequest;
///
/// let request = BatchRequest::new("group/app");
/// assert_eq!(request.max_units, 10);
/// assert_eq!(request.worker_count, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    /// Collection (project path) to review.
    pub collection_id: String,
    /// Review focus.
    pub mode: ReviewMode,
    /// Units to enumerate, by state.
    pub state: UnitState,
    /// Maximum units processed.
    pub max_units: usize,
    /// Publish generated reviews.
    pub publish: bool,
    /// Concurrent workers; 1 or less runs sequentially.
    pub worker_count: usize,
    /// Courtesy delay between units.
    pub inter_unit_delay: Duration,
    /// Candidate filters.
    pub filter: UnitFilter,
}

impl BatchRequest {
    /// A request for `collection_id` with default batch settings.
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self::from_config(collection_id, &BatchConfig::default())
    }

    /// A request for `collection_id` using the `[batch]` configuration section.
    pub fn from_config(collection_id: impl Into<String>, config: &BatchConfig) -> Self {
        Self {
            collection_id: collection_id.into(),
            mode: config.mode,
            state: config.state,
            max_units: config.max_units,
            publish: config.publish,
            worker_count: config.worker_count,
            inter_unit_delay: config.inter_unit_delay(),
            filter: UnitFilter::default(),
        }
    }

    /// Candidates to request so that filtering can still fill `max_units`.
    pub fn candidate_count(&self) -> usize {
        self.max_units.saturating_mul(2).min(MAX_CANDIDATES)
    }
}

/// Aggregate outcome of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Units processed (one result each).
    pub total_units: usize,
    /// Units whose pipeline completed.
    pub successful: usize,
    /// Units whose pipeline failed.
    pub failed: usize,
    /// Reviews published.
    pub published: usize,
    /// Wall time of the whole run, in seconds.
    pub total_elapsed_secs: f64,
    /// Run wall time divided by units processed; 0 with no units.
    pub average_elapsed_secs: f64,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Collection that was reviewed.
    pub collection_id: String,
    /// Review mode of the run.
    pub mode: ReviewMode,
    /// State filter of the run.
    pub state: UnitState,
    /// Worker count of the run.
    pub worker_count: usize,
    /// Run-level errors (enumeration failures).
    pub errors: Vec<String>,
}

impl BatchSummary {
    /// Percentage of successful units; 0.0 when nothing ran.
    ///
    /// # Examples
    ///
    /// ```
    /// # use vigil_batch::coordinator::{BatchRequest, BatchSummary};
    /// # let mut summary = BatchSummary::empty(&BatchRequest::new("g/p"), chrono::Utc::now());
    /// assert_eq!(summary.success_rate(), 0.0);
    /// summary.total_units = 4;
    /// summary.successful = 3;
    /// assert_eq!(summary.success_rate(), 75.0);
    /// ```
    pub fn success_rate(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total_units as f64 * 100.0
    }

    /// A zeroed summary for `request`.
    pub fn empty(request: &BatchRequest, started_at: DateTime<Utc>) -> Self {
        Self {
            total_units: 0,
            successful: 0,
            failed: 0,
            published: 0,
            total_elapsed_secs: 0.0,
            average_elapsed_secs: 0.0,
            started_at,
            finished_at: Utc::now(),
            collection_id: request.collection_id.clone(),
            mode: request.mode,
            state: request.state,
            worker_count: request.worker_count,
            errors: Vec::new(),
        }
    }

    fn from_results(
        request: &BatchRequest,
        results: &[UnitResult],
        started_at: DateTime<Utc>,
        elapsed: Duration,
        errors: Vec<String>,
    ) -> Self {
        let total_units = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let total_elapsed_secs = elapsed.as_secs_f64();
        Self {
            total_units,
            successful,
            failed: total_units - successful,
            published: results.iter().filter(|r| r.published).count(),
            total_elapsed_secs,
            average_elapsed_secs: if total_units == 0 {
                0.0
            } else {
                total_elapsed_secs / total_units as f64
            },
            errors,
            ..Self::empty(request, started_at)
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Batch review of {} ({} mode)", self.collection_id, self.mode)?;
        writeln!(f, "  Units:       {}", self.total_units)?;
        writeln!(
            f,
            "  Successful:  {} ({:.1}%)",
            self.successful,
            self.success_rate()
        )?;
        writeln!(f, "  Failed:      {}", self.failed)?;
        writeln!(f, "  Published:   {}", self.published)?;
        writeln!(
            f,
            "  Elapsed:     {:.2}s (avg {:.2}s/unit)",
            self.total_elapsed_secs, self.average_elapsed_secs
        )?;
        for e in &self.errors {
            writeln!(f, "  Error:       {e}")?;
        }
        Ok(())
    }
}

/// Drives batch runs over a [`UnitProcessor`] and keeps the last run's results.
pub struct BatchCoordinator {
    processor: Arc<UnitProcessor>,
    progress: Option<ProgressCallback>,
    results: Mutex<Vec<UnitResult>>,
}

impl BatchCoordinator {
    /// Create a coordinator dispatching to `processor`.
    pub fn new(processor: Arc<UnitProcessor>) -> Self {
        Self {
            processor,
            progress: None,
            results: Mutex::new(Vec::new()),
        }
    }

    /// Install a progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Results of the most recent run, in completion order.
    pub fn results(&self) -> Vec<UnitResult> {
        self.lock_results().clone()
    }

    /// Analytics over the most recent run; `None` if it produced no results.
    pub fn analytics(&self) -> Option<AnalyticsReport> {
        AnalyticsAggregator::analyze(&self.lock_results())
    }

    /// Write the most recent run's results to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] or [`VigilError::Serialization`] on failure.
    pub fn export_results(&self, path: &Path, format: ExportFormat) -> Result<(), VigilError> {
        export_results(&self.lock_results(), path, format)
    }

    /// Run a batch and summarize it.
    ///
    /// Never fails. If enumeration fails, the summary reports zero units and
    /// carries the error in [`BatchSummary::errors`].
    pub async fn run(&self, request: &BatchRequest) -> BatchSummary {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            collection = %request.collection_id,
            mode = %request.mode,
            state = %request.state,
            max_units = request.max_units,
            workers = request.worker_count,
            "starting batch run"
        );
        self.lock_results().clear();

        let units = match self.candidates(request).await {
            Ok(units) => units,
            Err(e) => {
                let message = format!("failed to list units for {}: {e}", request.collection_id);
                error!(collection = %request.collection_id, error = %e, "enumeration failed");
                return BatchSummary::from_results(
                    request,
                    &[],
                    started_at,
                    clock.elapsed(),
                    vec![message],
                );
            }
        };

        if units.is_empty() {
            warn!(
                collection = %request.collection_id,
                state = %request.state,
                "no units to process"
            );
            return BatchSummary::empty(request, started_at);
        }

        let total = units.len();
        info!(total, "found units to process");
        self.report(0, total, "Starting batch processing...");

        let results = if request.worker_count > 1 {
            self.dispatch_parallel(units, request).await
        } else {
            self.dispatch_sequential(units, request).await
        };

        let summary =
            BatchSummary::from_results(request, &results, started_at, clock.elapsed(), Vec::new());
        *self.lock_results() = results;

        info!(
            total = summary.total_units,
            successful = summary.successful,
            failed = summary.failed,
            published = summary.published,
            success_rate = summary.success_rate(),
            elapsed_secs = summary.total_elapsed_secs,
            "batch run complete"
        );
        summary
    }

    async fn candidates(&self, request: &BatchRequest) -> Result<Vec<UnitOfWork>, VigilError> {
        let listed = self
            .processor
            .list_units(
                &request.collection_id,
                request.state,
                request.candidate_count(),
            )
            .await?;
        let listed_count = listed.len();
        let mut kept = request.filter.apply(listed);
        kept.truncate(request.max_units);
        info!(listed = listed_count, kept = kept.len(), "enumerated candidates");
        Ok(kept
            .into_iter()
            .map(|meta| UnitOfWork::new(request.collection_id.clone(), meta))
            .collect())
    }

    async fn dispatch_sequential(
        &self,
        units: Vec<UnitOfWork>,
        request: &BatchRequest,
    ) -> Vec<UnitResult> {
        let total = units.len();
        let mut results = Vec::with_capacity(total);
        for (i, unit) in units.iter().enumerate() {
            self.report(i, total, &format!("Processing unit #{}", unit.id));
            results.push(process_guarded(&self.processor, unit, request).await);
            if i + 1 < total && !request.inter_unit_delay.is_zero() {
                tokio::time::sleep(request.inter_unit_delay).await;
            }
        }
        self.report(total, total, "Batch processing completed");
        results
    }

    /// Fixed pool of workers pulling from a shared queue; results return over
    /// a channel in completion order.
    async fn dispatch_parallel(
        &self,
        units: Vec<UnitOfWork>,
        request: &BatchRequest,
    ) -> Vec<UnitResult> {
        let total = units.len();
        let workers = request.worker_count.min(total);
        let queue: Arc<Mutex<VecDeque<(usize, UnitOfWork)>>> =
            Arc::new(Mutex::new(units.iter().cloned().enumerate().collect()));
        let (tx, mut rx) = mpsc::channel::<(usize, UnitResult)>(total);

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let processor = Arc::clone(&self.processor);
            let request = request.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some((index, unit)) = next else {
                        break;
                    };
                    let result = process_guarded(&processor, &unit, &request).await;
                    if tx.send((index, result)).await.is_err() {
                        warn!(worker, "result channel closed");
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let mut results = Vec::with_capacity(total);
        let mut seen = vec![false; total];
        while let Some((index, result)) = rx.recv().await {
            seen[index] = true;
            let message = format!(
                "Completed unit #{} ({}/{total})",
                result.unit_id,
                results.len() + 1
            );
            results.push(result);
            self.report(results.len(), total, &message);
            if !request.inter_unit_delay.is_zero() {
                tokio::time::sleep(request.inter_unit_delay).await;
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }
        for (unit, _) in units.iter().zip(&seen).filter(|(_, done)| !**done) {
            error!(unit = unit.id, "unit produced no result");
            results.push(UnitResult::failed(
                unit,
                request.mode,
                "worker terminated before producing a result",
                0.0,
            ));
        }

        self.report(total, total, "Parallel processing completed");
        results
    }

    fn report(&self, completed: usize, total: usize, message: &str) {
        if let Some(callback) = &self.progress {
            callback(completed, total, message);
        }
    }

    fn lock_results(&self) -> MutexGuard<'_, Vec<UnitResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process one unit, converting a panic into a failed result.
async fn process_guarded(
    processor: &UnitProcessor,
    unit: &UnitOfWork,
    request: &BatchRequest,
) -> UnitResult {
    let started = Instant::now();
    AssertUnwindSafe(processor.process(unit, request.mode, request.publish))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(&*panic);
            error!(unit = unit.id, panic = %message, "unit processing panicked");
            UnitResult::failed(
                unit,
                request.mode,
                format!("processing panicked: {message}"),
                started.elapsed().as_secs_f64(),
            )
        })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_count_overfetches_with_cap() {
        let mut request = BatchRequest::new("g/p");
        request.max_units = 10;
        assert_eq!(request.candidate_count(), 20);
        request.max_units = 80;
        assert_eq!(request.candidate_count(), 100);
        request.max_units = usize::MAX;
        assert_eq!(request.candidate_count(), 100);
    }

    #[test]
    fn success_rate_handles_empty_runs() {
        let request = BatchRequest::new("g/p");
        let summary =
            BatchSummary::from_results(&request, &[], Utc::now(), Duration::ZERO, Vec::new());
        assert_eq!(summary.total_units, 0);
        assert_eq!(summary.success_rate(), 0.0);
        assert_eq!(summary.average_elapsed_secs, 0.0);
    }

    #[test]
    fn summary_counts_match_results() {
        let request = BatchRequest::new("g/p");
        let unit = UnitOfWork::new("g/p", vigil_core::UnitMetadata::default());
        let mut ok = UnitResult::failed(&unit, ReviewMode::General, "x", 1.0);
        ok.success = true;
        ok.error = None;
        ok.published = true;
        let failed = UnitResult::failed(&unit, ReviewMode::General, "boom", 1.0);
        let results = vec![ok.clone(), ok, failed];

        let summary = BatchSummary::from_results(
            &request,
            &results,
            Utc::now(),
            Duration::from_secs(6),
            Vec::new(),
        );
        assert_eq!(summary.total_units, 3);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.published, 2);
        assert_eq!(summary.average_elapsed_secs, 2.0);
        assert!((summary.success_rate() - 66.666).abs() < 0.01);
        assert!(summary.to_string().contains("Failed:      1"));
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn Any + Send> = Box::new("bad state");
        assert_eq!(panic_message(&*boxed), "bad state");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }
}
