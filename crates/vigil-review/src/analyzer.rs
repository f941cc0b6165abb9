use std::collections::{BTreeSet, HashMap};

use regex::Regex;
use tracing::{debug, warn};
use vigil_batch::collaborators::Analyzer;
use vigil_core::{ChangeSet, FileChange, ImpactAnalysis, UnitMetadata, VigilError};

const BINARY_EXTENSIONS: [&str; 13] = [
    ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".ico", ".pdf", ".zip", ".tar", ".gz", ".exe",
    ".dll", ".so",
];

const CRITICAL_PATH_MARKERS: [&str; 5] = ["migration", "config", "security", "auth", "password"];

/// Bounds applied before a change set is analyzed.
///
/// # Examples
///
/// ```
/// use vigil_review::analyzer::AnalyzerLimits;
///
/// let limits = AnalyzerLimits::default();
/// assert_eq!(limits.max_files, 100);
/// assert_eq!(limits.max_diff_bytes, 5 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerLimits {
    /// Files beyond this count are ignored.
    pub max_files: usize,
    /// Diffs larger than this are skipped.
    pub max_diff_bytes: usize,
}

impl Default for AnalyzerLimits {
    fn default() -> Self {
        Self {
            max_files: 100,
            max_diff_bytes: 5 * 1024 * 1024,
        }
    }
}

struct DefinitionPatterns {
    function: Regex,
    type_def: Regex,
}

/// Diff-text analyzer producing size, language, and risk metrics.
///
/// Works line by line on unified diffs: no parsing of the languages
/// themselves, only extension lookup and per-language definition regexes
/// applied to added lines.
pub struct HeuristicAnalyzer {
    limits: AnalyzerLimits,
    patterns: HashMap<&'static str, DefinitionPatterns>,
}

impl HeuristicAnalyzer {
    /// Build an analyzer with the default [`AnalyzerLimits`].
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] if a definition pattern fails to compile.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_review::analyzer::HeuristicAnalyzer;
    ///
    /// let analyzer = HeuristicAnalyzer::new().unwrap();
    /// ```
    pub fn new() -> Result<Self, VigilError> {
        Self::with_limits(AnalyzerLimits::default())
    }

    /// Build an analyzer with custom limits.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] if a definition pattern fails to compile.
    pub fn with_limits(limits: AnalyzerLimits) -> Result<Self, VigilError> {
        let table: [(&'static str, &str, &str); 7] = [
            ("python", r"def\s+(\w+)", r"class\s+(\w+)"),
            (
                "javascript",
                r"(?:function\s+(\w+)|(\w+)\s*=\s*(?:function|\(.*?\)\s*=>))",
                r"class\s+(\w+)",
            ),
            (
                "typescript",
                r"(?:function\s+(\w+)|(\w+)\s*=\s*(?:function|\(.*?\)\s*=>))",
                r"(?:class|interface)\s+(\w+)",
            ),
            (
                "java",
                r"(?:public|private|protected)?\s*(?:static)?\s*\w+\s+(\w+)\s*\(",
                r"(?:public|private|protected)?\s*(?:abstract)?\s*class\s+(\w+)",
            ),
            ("cpp", r"(?:\w+\s+)?(\w+)\s*\([^)]*\)\s*\{", r"class\s+(\w+)"),
            (
                "go",
                r"func\s+(?:\(\w+\s+\*?\w+\)\s+)?(\w+)\s*\(",
                r"type\s+(\w+)\s+struct",
            ),
            ("rust", r"fn\s+(\w+)\s*\(", r"(?:struct|enum|trait)\s+(\w+)"),
        ];
        let mut patterns = HashMap::with_capacity(table.len());
        for (language, function, type_def) in table {
            let compile = |pattern: &str| {
                Regex::new(pattern).map_err(|e| {
                    VigilError::Config(format!("invalid {language} definition pattern: {e}"))
                })
            };
            patterns.insert(
                language,
                DefinitionPatterns {
                    function: compile(function)?,
                    type_def: compile(type_def)?,
                },
            );
        }
        Ok(Self { limits, patterns })
    }

    /// The limits this analyzer applies.
    pub fn limits(&self) -> AnalyzerLimits {
        self.limits
    }

    fn select<'a>(&self, changes: &'a [FileChange]) -> Vec<&'a FileChange> {
        changes
            .iter()
            .take(self.limits.max_files)
            .filter(|change| {
                if change.diff.len() > self.limits.max_diff_bytes {
                    warn!(
                        path = change.path(),
                        bytes = change.diff.len(),
                        "skipping oversize diff"
                    );
                    return false;
                }
                !is_binary(change)
            })
            .collect()
    }

    fn count_definitions(&self, language: &str, diff: &str) -> usize {
        let Some(patterns) = self.patterns.get(language) else {
            return 0;
        };
        added_lines(diff)
            .map(|line| {
                let line = line.trim();
                captured_names(&patterns.function, line) + captured_names(&patterns.type_def, line)
            })
            .sum()
    }
}

impl Analyzer for HeuristicAnalyzer {
    fn analyze(
        &self,
        metadata: &UnitMetadata,
        changes: &ChangeSet,
    ) -> Result<ImpactAnalysis, VigilError> {
        let files = self.select(&changes.changes);

        let mut lines_added = 0;
        let mut lines_removed = 0;
        let mut new_definitions = 0;
        let mut languages = BTreeSet::new();
        let mut critical_paths = Vec::new();

        for change in &files {
            let (added, removed) = count_lines(&change.diff);
            lines_added += added;
            lines_removed += removed;

            let path = change.path();
            if let Some(language) = language_for(path) {
                languages.insert(language);
                new_definitions += self.count_definitions(language, &change.diff);
            }
            if is_critical_path(path) {
                critical_paths.push(path.to_string());
            }
        }

        let complexity_score = complexity_score(
            files.len(),
            lines_added + lines_removed,
            new_definitions,
            languages.len(),
        );

        let mut risk_factors = Vec::new();
        if files.len() > 20 {
            risk_factors.push("Large number of files changed (>20)".to_string());
        }
        if lines_added + lines_removed > 500 {
            risk_factors.push("Large number of lines changed (>500)".to_string());
        }
        if complexity_score > 75 {
            risk_factors.push("High complexity score".to_string());
        }
        risk_factors.extend(
            critical_paths
                .iter()
                .map(|path| format!("Critical file modified: {path}")),
        );
        if new_definitions > 10 {
            risk_factors.push(format!("Many new code elements ({new_definitions})"));
        }

        debug!(
            unit = metadata.id,
            files = files.len(),
            skipped = changes.changes.len() - files.len(),
            lines_added,
            lines_removed,
            complexity_score,
            "analyzed change set"
        );

        Ok(ImpactAnalysis {
            file_count: files.len(),
            lines_added,
            lines_removed,
            complexity_score,
            risk_factors,
            languages: languages.into_iter().map(str::to_string).collect(),
            new_definitions,
        })
    }
}

/// Weighted 0–100 score from size, new definitions, and language spread.
///
/// # Examples
///
/// ```
/// use vigil_review::analyzer::complexity_score;
///
/// // 3 files, 120 changed lines, 2 definitions, 1 language.
/// assert_eq!(complexity_score(3, 120, 2, 1), 6 + 12 + 6 + 5);
/// assert_eq!(complexity_score(500, 10_000, 100, 10), 100);
/// ```
pub fn complexity_score(
    files: usize,
    changed_lines: usize,
    new_definitions: usize,
    languages: usize,
) -> u8 {
    let score = (files * 2).min(20)
        + (changed_lines / 10).min(30)
        + (new_definitions * 3).min(25)
        + (languages * 5).min(25);
    u8::try_from(score.min(100)).unwrap_or(100)
}

/// Language name for a path, by extension.
///
/// # Examples
///
/// ```
/// use vigil_review::analyzer::language_for;
///
/// assert_eq!(language_for("src/main.rs"), Some("rust"));
/// assert_eq!(language_for("web/App.TSX"), Some("typescript"));
/// assert_eq!(language_for("README"), None);
/// ```
pub fn language_for(path: &str) -> Option<&'static str> {
    let (_, extension) = path.rsplit_once('.')?;
    let language = match extension.to_lowercase().as_str() {
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "vue" => "vue",
        "java" => "java",
        "cpp" | "c" | "h" | "hpp" => "cpp",
        "cs" => "csharp",
        "php" => "php",
        "rb" => "ruby",
        "go" => "go",
        "rs" => "rust",
        "sql" => "sql",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        _ => return None,
    };
    Some(language)
}

fn is_binary(change: &FileChange) -> bool {
    let path = change.path().to_lowercase();
    BINARY_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        || change.diff.contains("Binary files")
        || change.diff.contains('\0')
}

fn is_critical_path(path: &str) -> bool {
    let path = path.to_lowercase();
    path.ends_with(".sql") || CRITICAL_PATH_MARKERS.iter().any(|m| path.contains(m))
}

fn added_lines(diff: &str) -> impl Iterator<Item = &str> {
    diff.lines()
        .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
        .map(|line| &line[1..])
}

fn count_lines(diff: &str) -> (usize, usize) {
    diff.lines().fold((0, 0), |(added, removed), line| {
        if line.starts_with('+') && !line.starts_with("+++") {
            (added + 1, removed)
        } else if line.starts_with('-') && !line.starts_with("---") {
            (added, removed + 1)
        } else {
            (added, removed)
        }
    })
}

/// Count capture matches whose first non-empty group is a valid identifier.
fn captured_names(pattern: &Regex, line: &str) -> usize {
    pattern
        .captures_iter(line)
        .filter(|caps| {
            caps.iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str())
                .find(|name| !name.is_empty())
                .is_some_and(is_identifier)
        })
        .count()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}
