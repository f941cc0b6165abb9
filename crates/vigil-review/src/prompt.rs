use std::fmt::Write as _;

use vigil_batch::collaborators::GenerationRequest;
use vigil_core::ReviewMode;

const RESPONSE_FORMAT: &str = "\
Format your response with exactly these markdown sections:
## Summary
Overall assessment in a few sentences.
## Detailed Comments
Specific findings, referencing files where possible.
## Recommendations
Actionable suggestions as a bullet list.";

const GENERAL_FOCUS: &str = "\
You are an expert code reviewer analyzing a GitLab merge request.

Review the changes for:
- Code quality and best practices
- Potential bugs or issues
- Architecture and design patterns
- Maintainability and readability

Be constructive: suggest improvements, note good practices, and ask for \
clarification where intent is unclear.";

const SECURITY_FOCUS: &str = "\
You are a security-focused code reviewer analyzing a GitLab merge request.

Look for security vulnerabilities:
- SQL injection and XSS risks
- Authentication and authorization issues
- Input validation problems
- Sensitive data exposure

Check for secure practices in error handling, configuration, cryptography, \
and access control.";

const PERFORMANCE_FOCUS: &str = "\
You are a performance-focused code reviewer analyzing a GitLab merge request.

Identify performance issues:
- Inefficient algorithms
- Database query patterns
- Memory usage
- CPU-intensive operations

Suggest caching, resource management, and scalability improvements where \
they apply.";

/// Build the system prompt for `mode`.
///
/// # Examples
///
/// ```
/// use vigil_core::ReviewMode;
/// use vigil_review::prompt::build_system_prompt;
///
/// let prompt = build_system_prompt(ReviewMode::Security);
/// assert!(prompt.contains("security-focused"));
/// assert!(prompt.contains("## Recommendations"));
/// ```
pub fn build_system_prompt(mode: ReviewMode) -> String {
    let focus = match mode {
        ReviewMode::General => GENERAL_FOCUS,
        ReviewMode::Security => SECURITY_FOCUS,
        ReviewMode::Performance => PERFORMANCE_FOCUS,
    };
    format!("{focus}\n\n{RESPONSE_FORMAT}")
}

/// Build the user prompt describing the merge request and its impact.
pub fn build_review_prompt(request: &GenerationRequest) -> String {
    let meta = &request.metadata;
    let impact = &request.impact;

    let mut prompt = String::from("## Merge Request\n");
    let _ = writeln!(prompt, "- **Title**: {}", meta.title);
    let _ = writeln!(prompt, "- **Author**: {}", meta.author);
    if !meta.source_branch.is_empty() {
        let _ = writeln!(
            prompt,
            "- **Branches**: {} -> {}",
            meta.source_branch, meta.target_branch
        );
    }
    let labels = if meta.labels.is_empty() {
        "None".to_string()
    } else {
        meta.labels.join(", ")
    };
    let _ = writeln!(prompt, "- **Labels**: {labels}");
    if !meta.description.is_empty() {
        let _ = writeln!(
            prompt,
            "- **Description**: {}",
            truncate_chars(&meta.description, 500)
        );
    }

    prompt.push_str("\n## Change Analysis\n");
    let _ = writeln!(prompt, "- **Files Changed**: {}", impact.file_count);
    let _ = writeln!(
        prompt,
        "- **Lines**: +{} / -{}",
        impact.lines_added, impact.lines_removed
    );
    let _ = writeln!(
        prompt,
        "- **Complexity Score**: {}/100",
        impact.complexity_score
    );
    let _ = writeln!(prompt, "- **New Definitions**: {}", impact.new_definitions);
    if !impact.languages.is_empty() {
        let _ = writeln!(prompt, "- **Languages**: {}", impact.languages.join(", "));
    }
    if !impact.risk_factors.is_empty() {
        let _ = writeln!(
            prompt,
            "- **Risk Factors**: {}",
            impact.risk_factors.join("; ")
        );
    }
    prompt.push_str("\nGenerate a thorough but concise code review.\n");
    prompt
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{ImpactAnalysis, UnitMetadata};

    fn request() -> GenerationRequest {
        GenerationRequest {
            metadata: UnitMetadata {
                id: 3,
                title: "Cache user lookups".into(),
                author: "erin".into(),
                description: "x".repeat(600),
                source_branch: "perf/cache".into(),
                target_branch: "main".into(),
                ..UnitMetadata::default()
            },
            impact: ImpactAnalysis {
                file_count: 4,
                lines_added: 120,
                lines_removed: 8,
                complexity_score: 42,
                risk_factors: vec!["Critical file modified: config/app.yml".into()],
                languages: vec!["rust".into(), "yaml".into()],
                new_definitions: 3,
            },
            mode: ReviewMode::Performance,
        }
    }

    #[test]
    fn system_prompt_differs_by_mode() {
        let general = build_system_prompt(ReviewMode::General);
        let perf = build_system_prompt(ReviewMode::Performance);
        assert_ne!(general, perf);
        assert!(perf.contains("performance-focused"));
        assert!(general.contains("## Detailed Comments"));
    }

    #[test]
    fn review_prompt_carries_metadata_and_impact() {
        let prompt = build_review_prompt(&request());
        assert!(prompt.contains("Cache user lookups"));
        assert!(prompt.contains("perf/cache -> main"));
        assert!(prompt.contains("**Labels**: None"));
        assert!(prompt.contains("+120 / -8"));
        assert!(prompt.contains("42/100"));
        assert!(prompt.contains("rust, yaml"));
        assert!(prompt.contains("config/app.yml"));
    }

    #[test]
    fn long_description_is_truncated() {
        let prompt = build_review_prompt(&request());
        assert!(prompt.contains(&format!("{}...", "x".repeat(500))));
        assert!(!prompt.contains(&"x".repeat(501)));
    }
}
