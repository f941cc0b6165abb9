//! Concurrent batch execution of the review pipeline.
//!
//! Enumerates and filters units from a source of record, runs each through
//! fetch, analyze, generate and publish, sequentially or on a bounded worker
//! pool, and aggregates the per-unit results into a summary and analytics.

pub mod analytics;
pub mod collaborators;
pub mod coordinator;
pub mod export;
pub mod filter;
pub mod processor;
