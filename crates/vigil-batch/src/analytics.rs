use std::collections::BTreeMap;

use serde::Serialize;

use crate::processor::UnitResult;

/// Derived statistics over a set of unit results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    /// Timing statistics over all results.
    pub performance: PerformanceStats,
    /// Review metrics over successful results.
    pub quality: QualityStats,
    /// Success, publish, and failure breakdown.
    pub success_metrics: SuccessMetrics,
}

/// Per-unit elapsed time statistics, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub total_elapsed_secs: f64,
    pub average_elapsed_secs: f64,
    pub fastest_secs: f64,
    pub slowest_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityStats {
    /// Mean complexity over successful units; 0 if none succeeded.
    pub average_complexity_score: f64,
    /// Successful units per risk classification.
    pub risk_distribution: BTreeMap<String, usize>,
    /// Size statistics; absent if nothing succeeded.
    pub file_changes: Option<FileChangeDistribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeDistribution {
    pub files_changed: CountStats,
    pub lines_added: CountStats,
    pub lines_removed: CountStats,
}

/// Sum, mean, and range of a count.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountStats {
    pub total: usize,
    pub average: f64,
    pub min: usize,
    pub max: usize,
}

impl CountStats {
    fn from_values(values: &[usize]) -> Option<Self> {
        let min = *values.iter().min()?;
        let max = *values.iter().max()?;
        let total: usize = values.iter().sum();
        Some(Self {
            total,
            average: total as f64 / values.len() as f64,
            min,
            max,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessMetrics {
    /// Percentage of successful units.
    pub success_rate: f64,
    /// Percentage of units whose review was published.
    pub publish_rate: f64,
    /// Failure messages bucketed by cause.
    pub error_categories: BTreeMap<String, usize>,
}

/// Computes [`AnalyticsReport`]s from result lists.
pub struct AnalyticsAggregator;

impl AnalyticsAggregator {
    /// Analyze `results`. Returns `None` for an empty slice.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_batch::analytics::AnalyticsAggregator;
    ///
    /// assert!(AnalyticsAggregator::analyze(&[]).is_none());
    /// ```
    pub fn analyze(results: &[UnitResult]) -> Option<AnalyticsReport> {
        if results.is_empty() {
            return None;
        }
        let count = results.len() as f64;
        let times: Vec<f64> = results.iter().map(|r| r.elapsed_secs).collect();
        let total_elapsed_secs: f64 = times.iter().sum();

        let performance = PerformanceStats {
            total_elapsed_secs,
            average_elapsed_secs: total_elapsed_secs / count,
            fastest_secs: times.iter().copied().fold(f64::INFINITY, f64::min),
            slowest_secs: times.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };

        let impacts: Vec<_> = results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.impact.as_ref())
            .collect();

        let average_complexity_score = if impacts.is_empty() {
            0.0
        } else {
            impacts
                .iter()
                .map(|i| f64::from(i.complexity_score))
                .sum::<f64>()
                / impacts.len() as f64
        };

        let mut risk_distribution = BTreeMap::new();
        for impact in &impacts {
            *risk_distribution.entry(impact.risk.to_string()).or_insert(0) += 1;
        }

        let files: Vec<usize> = impacts.iter().map(|i| i.file_count).collect();
        let added: Vec<usize> = impacts.iter().map(|i| i.lines_added).collect();
        let removed: Vec<usize> = impacts.iter().map(|i| i.lines_removed).collect();
        let file_changes = match (
            CountStats::from_values(&files),
            CountStats::from_values(&added),
            CountStats::from_values(&removed),
        ) {
            (Some(files_changed), Some(lines_added), Some(lines_removed)) => {
                Some(FileChangeDistribution {
                    files_changed,
                    lines_added,
                    lines_removed,
                })
            }
            _ => None,
        };

        let successful = results.iter().filter(|r| r.success).count() as f64;
        let published = results.iter().filter(|r| r.published).count() as f64;
        let mut error_categories = BTreeMap::new();
        for message in results
            .iter()
            .filter(|r| !r.success)
            .filter_map(|r| r.error.as_deref())
        {
            *error_categories
                .entry(error_bucket(message).to_string())
                .or_insert(0) += 1;
        }

        Some(AnalyticsReport {
            performance,
            quality: QualityStats {
                average_complexity_score,
                risk_distribution,
                file_changes,
            },
            success_metrics: SuccessMetrics {
                success_rate: successful / count * 100.0,
                publish_rate: published / count * 100.0,
                error_categories,
            },
        })
    }
}

/// Bucket a failure message by the first matching cause.
pub fn error_bucket(message: &str) -> &'static str {
    let message = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));
    if has(&["connection", "timeout", "timed out"]) {
        "connection_issues"
    } else if has(&["permission", "forbidden", "403"]) {
        "permission_issues"
    } else if has(&["not found", "404"]) {
        "not_found"
    } else if has(&["rate limit", "429"]) {
        "rate_limiting"
    } else {
        "other"
    }
}
