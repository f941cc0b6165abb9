//! Reviewing the merge request a GitLab pipeline was started for.
//!
//! [`CiEnvironment`] reads the predefined pipeline variables,
//! [`should_run_review`] applies the `[ci]` gate, and [`run_ci_review`] ties
//! both to a [`UnitProcessor`].

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use vigil_batch::collaborators::{GenerationRequest, Generator};
use vigil_batch::processor::{UnitProcessor, UnitResult};
use vigil_core::{CiConfig, ReviewArtifact, UnitMetadata, VigilError};

/// Pipeline variables describing the running job.
///
/// # Examples
///
/// ```
/// use vigil_review::ci::CiEnvironment;
///
/// let env = CiEnvironment::detect_from(|key| match key {
///     "GITLAB_CI" => Some("true".into()),
///     "CI_PROJECT_PATH" => Some("acme/app".into()),
///     "CI_MERGE_REQUEST_IID" => Some("12".into()),
///     _ => None,
/// });
/// assert!(env.is_gitlab_ci);
/// assert_eq!(env.merge_request_iid, Some(12));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CiEnvironment {
    /// `GITLAB_CI` is set.
    pub is_gitlab_ci: bool,
    /// `CI_PIPELINE_ID`.
    pub pipeline_id: Option<String>,
    /// `CI_JOB_ID`.
    pub job_id: Option<String>,
    /// `CI_COMMIT_SHA`.
    pub commit_sha: Option<String>,
    /// `CI_PROJECT_PATH`.
    pub project_path: Option<String>,
    /// `CI_MERGE_REQUEST_IID`; only set on merge request pipelines.
    pub merge_request_iid: Option<u64>,
}

impl CiEnvironment {
    /// Read the current process environment.
    pub fn detect() -> Self {
        Self::detect_from(|key| std::env::var(key).ok())
    }

    /// Read pipeline variables through `lookup`. Outside GitLab CI every field is empty.
    pub fn detect_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup("GITLAB_CI").is_none() {
            return Self::default();
        }
        Self {
            is_gitlab_ci: true,
            pipeline_id: lookup("CI_PIPELINE_ID"),
            job_id: lookup("CI_JOB_ID"),
            commit_sha: lookup("CI_COMMIT_SHA"),
            project_path: lookup("CI_PROJECT_PATH").filter(|p| !p.is_empty()),
            merge_request_iid: lookup("CI_MERGE_REQUEST_IID")
                .and_then(|iid| iid.trim().parse().ok()),
        }
    }

    /// Footer appended to notes posted from a pipeline job.
    pub fn note_footer(&self) -> String {
        format!(
            "\n---\n*Posted by GitLab CI pipeline #{} (job #{})*\n",
            self.pipeline_id.as_deref().unwrap_or("?"),
            self.job_id.as_deref().unwrap_or("?"),
        )
    }
}

/// Verdict of the pipeline gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiDecision {
    /// Review the merge request.
    Run,
    /// Leave it alone, for the given reason.
    Skip(String),
}

/// Decide whether `metadata` should be reviewed under `config`.
///
/// Checks, in order: the master switch, draft state, skip labels, required
/// labels, and the approval count.
///
/// # Examples
///
/// ```
/// use vigil_core::{CiConfig, UnitMetadata};
/// use vigil_review::ci::{should_run_review, CiDecision};
///
/// let wip = UnitMetadata { draft: true, ..UnitMetadata::default() };
/// assert!(matches!(should_run_review(&CiConfig::default(), &wip), CiDecision::Skip(_)));
/// assert_eq!(
///     should_run_review(&CiConfig::default(), &UnitMetadata::default()),
///     CiDecision::Run
/// );
/// ```
pub fn should_run_review(config: &CiConfig, metadata: &UnitMetadata) -> CiDecision {
    if !config.enabled {
        return CiDecision::Skip("CI reviews are disabled in configuration".into());
    }
    if metadata.draft && !config.trigger_on_draft {
        return CiDecision::Skip("merge request is a draft and trigger_on_draft is off".into());
    }
    if let Some(label) = metadata
        .labels
        .iter()
        .find(|label| config.skip_on_labels.contains(*label))
    {
        return CiDecision::Skip(format!("merge request has skip label '{label}'"));
    }
    if !config.review_on_labels.is_empty() && !metadata.has_any_label(&config.review_on_labels) {
        return CiDecision::Skip(format!(
            "merge request has none of the required labels: {}",
            config.review_on_labels.join(", ")
        ));
    }
    if metadata.upvotes < config.required_approvals {
        let missing = config.required_approvals - metadata.upvotes;
        return CiDecision::Skip(format!("merge request needs {missing} more approval(s)"));
    }
    CiDecision::Run
}

/// What a pipeline review did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CiReport {
    /// `true` if the gate declined the review.
    pub skipped: bool,
    /// Why the review ran or was skipped.
    pub reason: String,
    /// Project the merge request belongs to.
    pub project: String,
    /// Merge request iid.
    pub merge_request_iid: u64,
    /// Merge request as fetched; absent when reviews are disabled.
    pub unit: Option<UnitMetadata>,
    /// Pipeline result; absent when skipped.
    pub result: Option<UnitResult>,
    /// Pipeline variables the run used.
    pub environment: CiEnvironment,
}

/// Review the merge request of the current pipeline.
///
/// Publishes when `config.auto_post` is set. Failures inside the review
/// itself are reported in [`CiReport::result`].
///
/// # Errors
///
/// Returns [`VigilError::Config`] outside a GitLab merge request pipeline,
/// or the source's error if the merge request cannot be fetched.
pub async fn run_ci_review(
    processor: &UnitProcessor,
    config: &CiConfig,
    env: &CiEnvironment,
) -> Result<CiReport, VigilError> {
    if !env.is_gitlab_ci {
        return Err(VigilError::Config("not running in GitLab CI (GITLAB_CI is unset)".into()));
    }
    let (Some(project), Some(iid)) = (env.project_path.as_deref(), env.merge_request_iid) else {
        return Err(VigilError::Config(
            "CI_PROJECT_PATH and CI_MERGE_REQUEST_IID are required; \
             run the job in a merge request pipeline"
                .into(),
        ));
    };

    let mut report = CiReport {
        skipped: true,
        reason: String::new(),
        project: project.to_string(),
        merge_request_iid: iid,
        unit: None,
        result: None,
        environment: env.clone(),
    };
    if !config.enabled {
        report.reason = "CI reviews are disabled in configuration".into();
        info!(project, iid, reason = %report.reason, "skipping review");
        return Ok(report);
    }

    let unit = processor.fetch_unit(project, iid).await?;
    report.unit = Some(unit.metadata.clone());
    if let CiDecision::Skip(reason) = should_run_review(config, &unit.metadata) {
        info!(project, iid, %reason, "skipping review");
        report.reason = reason;
        return Ok(report);
    }

    info!(project, iid, mode = %config.mode, publish = config.auto_post, "running CI review");
    let result = processor.process(&unit, config.mode, config.auto_post).await;
    report.skipped = false;
    report.reason = "all review conditions met".into();
    report.result = Some(result);
    Ok(report)
}

/// Generator decorator that appends a fixed footer to published text.
pub struct FooterGenerator<G> {
    inner: G,
    footer: String,
}

impl<G: Generator> FooterGenerator<G> {
    /// Wrap `inner`, appending `footer` to everything it formats.
    pub fn new(inner: G, footer: impl Into<String>) -> Self {
        Self {
            inner,
            footer: footer.into(),
        }
    }
}

#[async_trait]
impl<G: Generator> Generator for FooterGenerator<G> {
    async fn generate(&self, request: &GenerationRequest) -> Result<ReviewArtifact, VigilError> {
        self.inner.generate(request).await
    }

    fn format_for_publish(&self, artifact: &ReviewArtifact) -> String {
        let mut text = self.inner.format_for_publish(artifact);
        text.push_str(&self.footer);
        text
    }
}
