use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a merge request as returned by enumeration.
///
/// # Examples
///
/// ```
/// use vigil_core::UnitMetadata;
///
/// let meta = UnitMetadata {
///     id: 42,
///     title: "Fix login redirect".into(),
///     author: "alice".into(),
///     labels: vec!["security".into()],
///     ..UnitMetadata::default()
/// };
/// assert!(meta.has_any_label(&["security".to_string()]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitMetadata {
    /// Identifier of the unit within its collection (the MR iid).
    pub id: u64,
    /// Title line.
    pub title: String,
    /// Free-form description body.
    #[serde(default)]
    pub description: String,
    /// Username of the author.
    pub author: String,
    /// Attached label names.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Branch the changes come from.
    #[serde(default)]
    pub source_branch: String,
    /// Branch the changes target.
    #[serde(default)]
    pub target_branch: String,
    /// Marked as draft (or work in progress).
    #[serde(default)]
    pub draft: bool,
    /// Approving votes so far.
    #[serde(default)]
    pub upvotes: u32,
}

impl UnitMetadata {
    /// Returns `true` if any of `labels` is attached to this unit.
    pub fn has_any_label(&self, labels: &[String]) -> bool {
        labels.iter().any(|wanted| self.labels.contains(wanted))
    }
}

/// One independently reviewable merge request.
///
/// Created during enumeration and read-only thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitOfWork {
    /// Unit identifier (copied from the metadata).
    pub id: u64,
    /// Project or collection the unit belongs to.
    pub collection_id: String,
    /// Metadata snapshot taken at enumeration time.
    pub metadata: UnitMetadata,
}

impl UnitOfWork {
    /// Wrap an enumerated metadata record for `collection_id`.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::{UnitMetadata, UnitOfWork};
    ///
    /// let metadata = UnitMetadata { id: 7, ..UnitMetadata::default() };
    /// let unit = UnitOfWork::new("group/project", metadata);
    /// assert_eq!(unit.id, 7);
    /// assert_eq!(unit.collection_id, "group/project");
    /// ```
    pub fn new(collection_id: impl Into<String>, metadata: UnitMetadata) -> Self {
        Self {
            id: metadata.id,
            collection_id: collection_id.into(),
            metadata,
        }
    }
}

/// How a file was touched by a change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    /// New file.
    Added,
    /// Removed file.
    Deleted,
    /// Moved, possibly with edits.
    Renamed,
    /// Edited in place.
    #[default]
    Modified,
}

impl fmt::Display for FileChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileChangeKind::Added => write!(f, "added"),
            FileChangeKind::Deleted => write!(f, "deleted"),
            FileChangeKind::Renamed => write!(f, "renamed"),
            FileChangeKind::Modified => write!(f, "modified"),
        }
    }
}

/// A single file in a change set, with its unified diff text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    /// Path before the change.
    pub old_path: String,
    /// Path after the change.
    pub new_path: String,
    /// Unified diff body for this file.
    pub diff: String,
    /// How the file was touched.
    pub kind: FileChangeKind,
}

impl FileChange {
    /// The path that best identifies the file (new path unless deleted).
    pub fn path(&self) -> &str {
        if self.new_path.is_empty() || self.kind == FileChangeKind::Deleted {
            &self.old_path
        } else {
            &self.new_path
        }
    }
}

/// All file changes belonging to one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Unit the changes belong to.
    pub unit_id: u64,
    /// Per-file changes.
    pub changes: Vec<FileChange>,
}

/// Output of the analyzer for one unit.
///
/// # Examples
///
/// ```
/// use vigil_core::{ImpactAnalysis, RiskLevel};
///
/// let impact = ImpactAnalysis { complexity_score: 80, ..ImpactAnalysis::default() };
/// assert_eq!(impact.risk_level(), RiskLevel::High);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactAnalysis {
    /// Number of files analyzed.
    pub file_count: usize,
    /// Lines added across analyzed files.
    pub lines_added: usize,
    /// Lines removed across analyzed files.
    pub lines_removed: usize,
    /// Complexity score (0–100).
    pub complexity_score: u8,
    /// Human-readable risk factors.
    pub risk_factors: Vec<String>,
    /// Languages touched, deduplicated.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Number of newly introduced function/type definitions.
    #[serde(default)]
    pub new_definitions: usize,
}

impl ImpactAnalysis {
    /// Coarse risk classification derived from complexity and risk factors.
    pub fn risk_level(&self) -> RiskLevel {
        RiskLevel::assess(self.complexity_score, self.risk_factors.len())
    }
}

/// Coarse risk classification of a reviewed unit.
///
/// # Examples
///
/// ```
/// use vigil_core::RiskLevel;
///
/// assert_eq!(RiskLevel::assess(30, 0), RiskLevel::Low);
/// assert_eq!(RiskLevel::assess(60, 0), RiskLevel::Medium);
/// assert_eq!(RiskLevel::assess(10, 4), RiskLevel::High);
/// assert_eq!(RiskLevel::High.to_string(), "HIGH");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// Small, contained change.
    Low,
    /// Moderate change worth a careful look.
    Medium,
    /// Large or sensitive change.
    High,
    /// Risk could not be assessed (fallback reviews).
    Unknown,
}

impl RiskLevel {
    /// Classify from a 0–100 complexity score and a risk-factor count.
    ///
    /// HIGH above 75 or with more than three factors, MEDIUM above 50 or with
    /// more than one factor, LOW otherwise.
    pub fn assess(complexity_score: u8, risk_factor_count: usize) -> Self {
        if complexity_score > 75 || risk_factor_count > 3 {
            RiskLevel::High
        } else if complexity_score > 50 || risk_factor_count > 1 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Generated review for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewArtifact {
    /// Unit the review belongs to.
    pub unit_id: u64,
    /// Primary summary. An empty summary is never published.
    pub summary: String,
    /// Detailed findings.
    #[serde(default)]
    pub detailed_comments: String,
    /// Actionable recommendations.
    #[serde(default)]
    pub recommendations: String,
    /// Overall risk classification.
    pub risk: RiskLevel,
    /// Mode the review was generated in.
    pub mode: ReviewMode,
    /// `true` when produced by a fallback or degraded path.
    #[serde(default)]
    pub fallback: bool,
    /// Generation time.
    pub generated_at: DateTime<Utc>,
}

/// Confirmation returned after publishing a review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    /// Identifier of the created note or comment.
    pub id: u64,
}

/// Focus of the generated review.
///
/// # Examples
///
/// ```
/// use vigil_core::ReviewMode;
///
/// let mode: ReviewMode = "security".parse().unwrap();
/// assert_eq!(mode, ReviewMode::Security);
/// assert_eq!(ReviewMode::default(), ReviewMode::General);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    /// Quality, bugs, design, maintainability.
    #[default]
    General,
    /// Vulnerabilities and secure practices.
    Security,
    /// Algorithmic and resource efficiency.
    Performance,
}

impl fmt::Display for ReviewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewMode::General => write!(f, "general"),
            ReviewMode::Security => write!(f, "security"),
            ReviewMode::Performance => write!(f, "performance"),
        }
    }
}

impl FromStr for ReviewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "general" => Ok(ReviewMode::General),
            "security" => Ok(ReviewMode::Security),
            "performance" => Ok(ReviewMode::Performance),
            other => Err(format!("unknown review mode: {other}")),
        }
    }
}

/// Merge-request state used to select candidates.
///
/// # Examples
///
/// ```
/// use vigil_core::UnitState;
///
/// let state: UnitState = "merged".parse().unwrap();
/// assert_eq!(state.to_string(), "merged");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    /// Open and awaiting review.
    #[default]
    Opened,
    /// Already merged.
    Merged,
    /// Closed without merging.
    Closed,
    /// Any state.
    All,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Opened => write!(f, "opened"),
            UnitState::Merged => write!(f, "merged"),
            UnitState::Closed => write!(f, "closed"),
            UnitState::All => write!(f, "all"),
        }
    }
}

impl FromStr for UnitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "opened" | "open" => Ok(UnitState::Opened),
            "merged" => Ok(UnitState::Merged),
            "closed" => Ok(UnitState::Closed),
            "all" => Ok(UnitState::All),
            other => Err(format!("unknown unit state: {other}")),
        }
    }
}
