//! Contracts for the external components the batch engine drives.
//!
//! Implementations live elsewhere (see `vigil-review`); tests use in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vigil_core::{
    ChangeSet, ImpactAnalysis, PublishReceipt, ReviewArtifact, ReviewMode, UnitMetadata,
    UnitState, VigilError,
};

/// System of record holding the units (e.g. a GitLab project).
///
/// Implementations report transport problems as [`VigilError::Connection`],
/// [`VigilError::Timeout`], or [`VigilError::Http`] so that retries and
/// circuit breakers can classify them.
#[async_trait]
pub trait SourceOfRecord: Send + Sync {
    /// List up to `max_count` units of `collection_id` in `state`, newest first.
    async fn list_units(
        &self,
        collection_id: &str,
        state: UnitState,
        max_count: usize,
    ) -> Result<Vec<UnitMetadata>, VigilError>;

    /// Fetch the current metadata of one unit.
    async fn get_unit(&self, collection_id: &str, unit_id: u64)
        -> Result<UnitMetadata, VigilError>;

    /// Fetch the file changes of one unit.
    async fn get_change_set(&self, collection_id: &str, unit_id: u64)
        -> Result<ChangeSet, VigilError>;

    /// Attach `text` to the unit as a comment.
    async fn publish(
        &self,
        collection_id: &str,
        unit_id: u64,
        text: &str,
    ) -> Result<PublishReceipt, VigilError>;
}

/// Derives impact metrics from a unit's changes.
pub trait Analyzer: Send + Sync {
    /// Analyze `changes` belonging to the unit described by `metadata`.
    fn analyze(
        &self,
        metadata: &UnitMetadata,
        changes: &ChangeSet,
    ) -> Result<ImpactAnalysis, VigilError>;
}

/// Produces a review from an impact analysis.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a review of `request.impact` in `request.mode`.
    async fn generate(&self, request: &GenerationRequest) -> Result<ReviewArtifact, VigilError>;

    /// Render an artifact as the text that gets published.
    fn format_for_publish(&self, artifact: &ReviewArtifact) -> String;
}

/// Everything a generator (or its degraded substitute) needs for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// Unit being reviewed.
    pub metadata: UnitMetadata,
    /// Analyzer output for the unit.
    pub impact: ImpactAnalysis,
    /// Review focus.
    pub mode: ReviewMode,
}
