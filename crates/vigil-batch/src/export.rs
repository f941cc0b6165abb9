use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use tracing::{info, warn};
use vigil_core::VigilError;

use crate::processor::UnitResult;

/// File format for [`export_results`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty-printed JSON array of result records.
    #[default]
    Json,
    /// Header line plus one comma-separated row per result.
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unsupported export format: {other}")),
        }
    }
}

/// Write `results` to `path` in `format`, creating missing parent
/// directories. An empty slice writes nothing.
///
/// # Errors
///
/// Returns [`VigilError::Io`] if the file cannot be written, or
/// [`VigilError::Serialization`] if JSON encoding fails.
pub fn export_results(
    results: &[UnitResult],
    path: &Path,
    format: ExportFormat,
) -> Result<(), VigilError> {
    if results.is_empty() {
        warn!("no results to export");
        return Ok(());
    }
    let content = match format {
        ExportFormat::Json => serde_json::to_string_pretty(results)?,
        ExportFormat::Csv => to_csv(results)?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    info!(path = %path.display(), %format, count = results.len(), "exported results");
    Ok(())
}

/// One CSV row; field order is column order.
#[derive(Serialize)]
struct CsvRecord<'a> {
    unit_id: u64,
    collection_id: &'a str,
    mode: String,
    success: bool,
    elapsed_secs: String,
    complexity_score: Option<u8>,
    risk: Option<String>,
    file_count: Option<usize>,
    lines_added: Option<usize>,
    lines_removed: Option<usize>,
    error: Option<&'a str>,
    published: bool,
    fallback: bool,
    timestamp: String,
}

impl<'a> From<&'a UnitResult> for CsvRecord<'a> {
    fn from(r: &'a UnitResult) -> Self {
        let impact = r.impact.as_ref();
        Self {
            unit_id: r.unit_id,
            collection_id: &r.collection_id,
            mode: r.mode.to_string(),
            success: r.success,
            elapsed_secs: format!("{:.3}", r.elapsed_secs),
            complexity_score: impact.map(|i| i.complexity_score),
            risk: impact.map(|i| i.risk.to_string()),
            file_count: impact.map(|i| i.file_count),
            lines_added: impact.map(|i| i.lines_added),
            lines_removed: impact.map(|i| i.lines_removed),
            error: r.error.as_deref(),
            published: r.published,
            fallback: r.fallback,
            timestamp: r.timestamp.to_rfc3339(),
        }
    }
}

/// Render results as CSV: a header row, then one row per result.
///
/// # Errors
///
/// Returns [`VigilError::Io`] if a record cannot be encoded.
pub fn to_csv(results: &[UnitResult]) -> Result<String, VigilError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for result in results {
        writer
            .serialize(CsvRecord::from(result))
            .map_err(std::io::Error::from)?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    String::from_utf8(bytes).map_err(|e| VigilError::InvalidInput(e.to_string()))
}
