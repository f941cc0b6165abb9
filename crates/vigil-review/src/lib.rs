//! Concrete collaborators for the batch review engine.
//!
//! Provides the GitLab merge-request source, the heuristic diff analyzer,
//! an OpenAI-compatible LLM client, and the review generator with its
//! deterministic fallback. [`ci`] drives a single review from a pipeline job.

pub mod analyzer;
pub mod ci;
pub mod generator;
pub mod gitlab;
pub mod llm;
pub mod prompt;
mod transport;
