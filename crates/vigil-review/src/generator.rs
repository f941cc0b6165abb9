use std::collections::BTreeSet;
use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use vigil_batch::collaborators::{GenerationRequest, Generator};
use vigil_core::{ReviewArtifact, RiskLevel, VigilError};

use crate::llm::{ChatMessage, LlmClient};
use crate::prompt::{build_review_prompt, build_system_prompt};

/// Review generator backed by an OpenAI-compatible chat model.
///
/// Errors from the model are returned unchanged so the caller's invoker can
/// retry them and account for them in the `llm` circuit.
pub struct LlmReviewGenerator {
    client: LlmClient,
}

impl LlmReviewGenerator {
    /// Wrap an LLM client.
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Generator for LlmReviewGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<ReviewArtifact, VigilError> {
        let unit_id = request.metadata.id;
        info!(
            unit = unit_id,
            mode = %request.mode,
            model = self.client.model(),
            "generating review"
        );

        let messages = vec![
            ChatMessage::system(build_system_prompt(request.mode)),
            ChatMessage::user(build_review_prompt(request)),
        ];
        let response = self.client.chat(messages).await?;
        let sections = ReviewSections::parse(&response);
        debug!(
            unit = unit_id,
            structured = sections.is_structured(),
            chars = response.len(),
            "parsed review response"
        );

        Ok(ReviewArtifact {
            unit_id,
            summary: sections
                .summary
                .unwrap_or_else(|| response.trim().to_string()),
            detailed_comments: sections.detailed_comments.unwrap_or_default(),
            recommendations: sections.recommendations.unwrap_or_default(),
            risk: request.impact.risk_level(),
            mode: request.mode,
            fallback: false,
            generated_at: Utc::now(),
        })
    }

    fn format_for_publish(&self, artifact: &ReviewArtifact) -> String {
        format_for_publish(artifact)
    }
}

/// Sections extracted from a model response.
///
/// # Examples
///
/// ```
/// use vigil_review::generator::ReviewSections;
///
/// let text = "## Summary\nLooks good.\n## Recommendations\n- add tests";
/// let sections = ReviewSections::parse(text);
/// assert_eq!(sections.summary.as_deref(), Some("Looks good."));
/// assert_eq!(sections.recommendations.as_deref(), Some("- add tests"));
/// assert!(sections.detailed_comments.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewSections {
    pub summary: Option<String>,
    pub detailed_comments: Option<String>,
    pub recommendations: Option<String>,
}

#[derive(Clone, Copy)]
enum Section {
    Summary,
    DetailedComments,
    Recommendations,
}

impl ReviewSections {
    /// Split `response` on `## Heading` or `**Heading**` lines.
    ///
    /// Text before the first recognized heading is ignored; empty sections
    /// are left as `None`.
    pub fn parse(response: &str) -> Self {
        let mut sections = Self::default();
        let mut current: Option<Section> = None;
        let mut buffer: Vec<&str> = Vec::new();

        for line in response.lines() {
            let line = line.trim();
            match heading(line) {
                Some(next) => {
                    sections.store(current, &buffer);
                    current = Some(next);
                    buffer.clear();
                }
                None if current.is_some() => buffer.push(line),
                None => {}
            }
        }
        sections.store(current, &buffer);
        sections
    }

    /// Returns `true` if any heading was recognized with content.
    pub fn is_structured(&self) -> bool {
        self.summary.is_some() || self.detailed_comments.is_some() || self.recommendations.is_some()
    }

    fn store(&mut self, section: Option<Section>, lines: &[&str]) {
        let Some(section) = section else { return };
        let text = lines.join("\n").trim().to_string();
        if text.is_empty() {
            return;
        }
        let slot = match section {
            Section::Summary => &mut self.summary,
            Section::DetailedComments => &mut self.detailed_comments,
            Section::Recommendations => &mut self.recommendations,
        };
        *slot = Some(text);
    }
}

fn heading(line: &str) -> Option<Section> {
    let title = line
        .strip_prefix("## ")
        .or_else(|| line.strip_prefix("**"))?
        .trim_start_matches('-')
        .trim();
    let title = title.to_lowercase();
    if title.starts_with("summary") {
        Some(Section::Summary)
    } else if title.starts_with("detailed comments") || title.starts_with("detailed analysis") {
        Some(Section::DetailedComments)
    } else if title.starts_with("recommendations") {
        Some(Section::Recommendations)
    } else {
        None
    }
}

/// Deterministic review computed from the impact analysis alone.
///
/// Used as the degraded substitute for `review_generation` when the LLM is
/// unavailable. The artifact is marked as a fallback.
///
/// # Examples
///
/// ```
/// use vigil_batch::collaborators::GenerationRequest;
/// use vigil_core::{ImpactAnalysis, ReviewMode, RiskLevel, UnitMetadata};
/// use vigil_review::generator::heuristic_review;
///
/// let request = GenerationRequest {
///     metadata: UnitMetadata { id: 9, ..UnitMetadata::default() },
///     impact: ImpactAnalysis { file_count: 2, complexity_score: 20, ..ImpactAnalysis::default() },
///     mode: ReviewMode::General,
/// };
/// let artifact = heuristic_review(&request).unwrap();
/// assert!(artifact.fallback);
/// assert_eq!(artifact.risk, RiskLevel::Low);
/// assert!(artifact.summary.contains("2 files"));
/// ```
pub fn heuristic_review(request: &GenerationRequest) -> Result<ReviewArtifact, VigilError> {
    let impact = &request.impact;
    let languages: BTreeSet<&str> = impact.languages.iter().map(String::as_str).collect();

    let mut summary = format!(
        "This merge request modifies {} files with {} additions and {} deletions. \
         Complexity score: {}/100.",
        impact.file_count, impact.lines_added, impact.lines_removed, impact.complexity_score
    );
    if !languages.is_empty() {
        let _ = write!(
            summary,
            " Languages: {}.",
            languages.into_iter().collect::<Vec<_>>().join(", ")
        );
    }

    let mut detailed_comments = format!(
        "Automated analysis only; the language model was unavailable.\n\n\
         - {} new functions or types introduced",
        impact.new_definitions
    );
    if impact.risk_factors.is_empty() {
        detailed_comments.push_str("\n- No significant risk factors identified");
    } else {
        for factor in &impact.risk_factors {
            let _ = write!(detailed_comments, "\n- Risk: {factor}");
        }
    }

    Ok(ReviewArtifact {
        unit_id: request.metadata.id,
        summary,
        detailed_comments,
        recommendations: "- Review for adherence to coding standards\n\
                          - Ensure adequate test coverage\n\
                          - Verify documentation is updated"
            .to_string(),
        risk: impact.risk_level(),
        mode: request.mode,
        fallback: true,
        generated_at: Utc::now(),
    })
}

/// Render an artifact as a merge request note.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use vigil_core::{ReviewArtifact, ReviewMode, RiskLevel};
/// use vigil_review::generator::format_for_publish;
///
/// let artifact = ReviewArtifact {
///     unit_id: 1,
///     summary: "Small, safe change.".into(),
///     detailed_comments: String::new(),
///     recommendations: String::new(),
///     risk: RiskLevel::Low,
///     mode: ReviewMode::Security,
///     fallback: false,
///     generated_at: Utc::now(),
/// };
/// let note = format_for_publish(&artifact);
/// assert!(note.starts_with("# Automated Code Review"));
/// assert!(note.contains("Review Type: security"));
/// ```
pub fn format_for_publish(artifact: &ReviewArtifact) -> String {
    let marker = match artifact.risk {
        RiskLevel::High => "\u{1f534}",
        RiskLevel::Medium => "\u{1f7e1}",
        RiskLevel::Low => "\u{1f7e2}",
        RiskLevel::Unknown => "\u{26aa}",
    };
    let mut note = format!(
        "# Automated Code Review {marker}\n\n**Risk:** {}\n\n## Summary\n{}\n",
        artifact.risk,
        artifact.summary.trim()
    );
    if !artifact.detailed_comments.trim().is_empty() {
        let _ = write!(
            note,
            "\n## Detailed Analysis\n{}\n",
            artifact.detailed_comments.trim()
        );
    }
    if !artifact.recommendations.trim().is_empty() {
        let _ = write!(
            note,
            "\n## Recommendations\n{}\n",
            artifact.recommendations.trim()
        );
    }
    let origin = if artifact.fallback {
        "heuristic fallback"
    } else {
        "Vigil"
    };
    let _ = write!(
        note,
        "\n---\n*Generated by {origin} - Review Type: {}*\n",
        artifact.mode
    );
    note
}
