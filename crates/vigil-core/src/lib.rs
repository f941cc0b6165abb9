//! Core types, configuration, and error handling for the Vigil platform.
//!
//! This crate provides the shared foundation used by all other Vigil crates:
//! - [`VigilError`]: unified error type using `thiserror`, classified by [`ErrorCategory`]
//! - [`VigilConfig`]: configuration loaded from `.vigil.toml`
//! - Shared types: [`UnitOfWork`], [`UnitMetadata`], [`ChangeSet`], [`ImpactAnalysis`],
//!   [`ReviewArtifact`], [`RiskLevel`], [`ReviewMode`], [`UnitState`]

mod config;
mod error;
mod types;

pub use config::{
    duration_from_secs, BatchConfig, CiConfig, CircuitBreakerConfig, GitLabConfig, LlmConfig,
    RetryConfig, VigilConfig, MAX_SECS,
};
pub use error::{ErrorCategory, VigilError};
pub use types::{
    ChangeSet, FileChange, FileChangeKind, ImpactAnalysis, PublishReceipt, ReviewArtifact,
    ReviewMode, RiskLevel, UnitMetadata, UnitOfWork, UnitState,
};

/// A convenience `Result` type for Vigil operations.
pub type Result<T> = std::result::Result<T, VigilError>;
