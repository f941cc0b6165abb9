use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use vigil_batch::analytics::AnalyticsAggregator;
use vigil_batch::collaborators::Generator;
use vigil_batch::coordinator::{BatchCoordinator, BatchRequest, BatchSummary, ProgressCallback};
use vigil_batch::export::ExportFormat;
use vigil_batch::filter::UnitFilter;
use vigil_batch::processor::{
    register_default_fallbacks, UnitProcessor, UnitResult, GENERATOR_DEPENDENCY,
    REVIEW_GENERATION,
};
use vigil_core::{ReviewArtifact, ReviewMode, UnitMetadata, UnitState, VigilConfig};
use vigil_resilience::{ErrorRecoveryManager, GracefulDegradationRegistry, ResilientInvoker};
use vigil_review::analyzer::HeuristicAnalyzer;
use vigil_review::ci::{run_ci_review, CiEnvironment, CiReport, FooterGenerator};
use vigil_review::generator::{format_for_publish, heuristic_review, LlmReviewGenerator};
use vigil_review::gitlab::{parse_merge_request_url, GitLabClient};
use vigil_review::llm::LlmClient;

const CONFIG_FILE: &str = ".vigil.toml";

#[derive(Parser)]
#[command(
    name = "vigil",
    version,
    about = "Resilient batch code review for GitLab merge requests",
    long_about = "Vigil reviews many merge requests in one run, tolerating flaky dependencies.\n\n\
                   Each merge request is fetched, analyzed, reviewed by an LLM, and optionally\n\
                   published as a note. Transient failures are retried with backoff, repeatedly\n\
                   failing services are cut off by a circuit breaker, and reviews fall back to a\n\
                   heuristic summary when the LLM is unavailable.\n\n\
                   Examples:\n  \
                     vigil batch group/project                     Review up to 10 open MRs\n  \
                     vigil batch group/project --workers 1         Review one MR at a time\n  \
                     vigil batch group/project --label security --mode security --publish\n  \
                     vigil batch group/project --export results.csv --export-format csv\n  \
                     vigil review https://gitlab.com/group/project/-/merge_requests/42\n  \
                     vigil review group/project --mr 42 --publish  Review and post one MR\n  \
                     vigil list group/project --state merged       Show recent merged MRs\n  \
                     vigil ci                                      Review the pipeline's MR\n  \
                     vigil init                                    Write a .vigil.toml template"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .vigil.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Review a batch of merge requests from one project
    #[command(long_about = "Review a batch of merge requests from one project.\n\n\
        Lists candidate merge requests, applies the filters, and reviews up to\n\
        --max-units of them. With --workers 1 units run one at a time with\n\
        --delay seconds between them; otherwise a worker pool processes them\n\
        concurrently. Every unit yields exactly one result.\n\n\
        Examples:\n  vigil batch group/app --author alice --created-after 2024-01-01\n  \
        vigil batch 1234 --state merged --format json --analytics")]
    Batch {
        /// Project path (group/project) or numeric id
        project: String,

        /// Review focus (general, security, performance)
        #[arg(long)]
        mode: Option<ReviewMode>,

        /// Merge request state to select (opened, merged, closed, all)
        #[arg(long)]
        state: Option<UnitState>,

        /// Maximum merge requests to review
        #[arg(long)]
        max_units: Option<usize>,

        /// Concurrent workers; 1 runs sequentially
        #[arg(long)]
        workers: Option<usize>,

        /// Seconds to wait between units
        #[arg(long)]
        delay: Option<f64>,

        /// Post each review as a merge request note
        #[arg(long)]
        publish: bool,

        /// Keep merge requests whose author contains this text
        #[arg(long)]
        author: Option<String>,

        /// Keep merge requests with any of these labels (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,

        /// Keep merge requests whose title or description mentions any keyword (repeatable)
        #[arg(long = "keyword")]
        keywords: Vec<String>,

        /// Keep merge requests created on or after this date (YYYY-MM-DD or RFC 3339)
        #[arg(long, value_parser = parse_date)]
        created_after: Option<DateTime<Utc>>,

        /// Output format for the summary
        #[arg(long, default_value = "text")]
        format: OutputFormat,

        /// Write per-unit results to this file
        #[arg(long)]
        export: Option<PathBuf>,

        /// Format of the --export file (json, csv)
        #[arg(long, default_value = "json")]
        export_format: ExportFormat,

        /// Also print analytics over the results
        #[arg(long)]
        analytics: bool,
    },
    /// Review a single merge request
    #[command(long_about = "Review a single merge request.\n\n\
        TARGET is either a merge request URL or, together with --mr, a project\n\
        path or id. The review is printed; --publish also posts it as a note.\n\n\
        Examples:\n  vigil review https://gitlab.com/acme/app/-/merge_requests/42\n  \
        vigil review acme/app --mr 42 --mode security --format json")]
    Review {
        /// Merge request URL, or project path when --mr is given
        target: String,

        /// Merge request iid within the project
        #[arg(long)]
        mr: Option<u64>,

        /// Review focus (general, security, performance)
        #[arg(long)]
        mode: Option<ReviewMode>,

        /// Post the review as a merge request note
        #[arg(long)]
        publish: bool,

        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
    /// List merge requests of a project
    List {
        /// Project path (group/project) or numeric id
        project: String,

        /// Merge request state to list (opened, merged, closed, all)
        #[arg(long)]
        state: Option<UnitState>,

        /// Maximum merge requests to show
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
    /// Review the merge request of the current GitLab CI pipeline
    #[command(long_about = "Review the merge request of the current GitLab CI pipeline.\n\n\
        Reads GITLAB_CI, CI_PROJECT_PATH, CI_MERGE_REQUEST_IID, CI_PIPELINE_ID and\n\
        CI_JOB_ID. The [ci] section (or CI_REVIEW_* variables) decides whether the\n\
        merge request is reviewed: drafts, skip labels, required labels and\n\
        approvals are checked in that order. Posted notes carry a pipeline footer.\n\n\
        Exits with status 1 if the review itself fails.")]
    Ci {
        /// Review focus, overriding [ci] mode
        #[arg(long)]
        mode: Option<ReviewMode>,

        /// Post the review even if [ci] auto_post is off
        #[arg(long)]
        publish: bool,

        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
    /// Create a default .vigil.toml in the current directory
    #[command(long_about = "Create a default .vigil.toml in the current directory.\n\n\
        Generates a commented template with all available options.\n\
        Fails if .vigil.toml already exists.")]
    Init,
    /// Generate shell completion scripts
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable summary
    Text,
    /// Machine-readable JSON with camelCase keys
    Json,
}

const DEFAULT_CONFIG: &str = r#"# Vigil configuration
# See: vigil --help

[gitlab]
# url = "https://gitlab.com"
# token = ""                  # or set GITLAB_TOKEN
# timeout_secs = 30

[llm]
# provider = "openai"         # openai | ollama
# model = "gpt-4o"
# api_key = ""                # or set LLM_API_KEY
# base_url = ""               # custom OpenAI-compatible endpoint
# timeout_secs = 120

[retry]
# max_attempts = 3
# base_delay_secs = 1.0
# max_delay_secs = 60.0
# exponential_base = 2.0
# jitter = true
# retryable_status_codes = [429, 500, 502, 503, 504]
# retry_on_connection = true
# retry_on_timeout = true

[circuit_breaker]
# failure_threshold = 5
# recovery_timeout_secs = 60.0

[batch]
# mode = "general"            # general | security | performance
# state = "opened"            # opened | merged | closed | all
# max_units = 10
# worker_count = 3
# inter_unit_delay_secs = 1.0
# publish = false

[ci]
# enabled = true              # or set CI_REVIEW_ENABLED
# mode = "general"            # or set CI_REVIEW_TYPE
# auto_post = false           # or set CI_AUTO_POST
# trigger_on_draft = false
# required_approvals = 0
# review_on_labels = []       # review only MRs carrying one of these
# skip_on_labels = ["skip-review", "no-review"]
"#;

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Batch {
            project,
            mode,
            state,
            max_units,
            workers,
            delay,
            publish,
            author,
            labels,
            keywords,
            created_after,
            format,
            export,
            export_format,
            analytics,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            let batch = &mut config.batch;
            if let Some(mode) = mode {
                batch.mode = mode;
            }
            if let Some(state) = state {
                batch.state = state;
            }
            if let Some(max_units) = max_units {
                batch.max_units = max_units;
            }
            if let Some(workers) = workers {
                batch.worker_count = workers;
            }
            if let Some(delay) = delay {
                batch.inter_unit_delay_secs = delay;
            }
            batch.publish |= publish;
            ensure_valid(&config)?;

            let mut request = BatchRequest::from_config(project, &config.batch);
            request.filter = UnitFilter {
                author,
                labels,
                keywords,
                created_after,
            };

            let coordinator = BatchCoordinator::new(Arc::new(build_processor(&config, None)?));
            let progress = progress_bar();
            let coordinator = match &progress {
                Some(pb) => coordinator.with_progress(progress_callback(pb.clone())),
                None => coordinator,
            };

            let summary = coordinator.run(&request).await;
            if let Some(pb) = &progress {
                pb.finish_and_clear();
            }

            if let Some(path) = &export {
                coordinator.export_results(path, export_format)?;
                eprintln!("Exported results to {}", path.display());
            }
            print_summary(&summary, format, analytics.then(|| coordinator.results()))?;

            if !summary.errors.is_empty() {
                std::process::exit(1);
            }
        }
        Command::Review {
            target,
            mr,
            mode,
            publish,
            format,
        } => {
            let config = load_config(cli.config.as_deref())?;
            ensure_valid(&config)?;
            let (project, iid) = match mr {
                Some(iid) => (target, iid),
                None => parse_merge_request_url(&target)?,
            };
            let mode = mode.unwrap_or(config.batch.mode);

            let processor = build_processor(&config, None)?;
            let unit = processor.fetch_unit(&project, iid).await?;
            let (result, artifact) = processor.process_with_review(&unit, mode, publish).await;
            print_review(&result, artifact.as_ref(), format)?;

            if !result.success {
                std::process::exit(1);
            }
        }
        Command::List {
            project,
            state,
            limit,
            format,
        } => {
            let config = load_config(cli.config.as_deref())?;
            ensure_valid(&config)?;
            let state = state.unwrap_or(config.batch.state);

            let processor = build_processor(&config, None)?;
            let units = processor.list_units(&project, state, limit).await?;
            print_units(&units, format)?;
        }
        Command::Ci {
            mode,
            publish,
            format,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(mode) = mode {
                config.ci.mode = mode;
            }
            config.ci.auto_post |= publish;
            ensure_valid(&config)?;

            let env = CiEnvironment::detect();
            let processor = build_processor(&config, Some(env.note_footer()))?;
            let report = run_ci_review(&processor, &config.ci, &env).await?;
            print_ci_report(&report, format)?;

            if report.result.as_ref().is_some_and(|result| !result.success) {
                std::process::exit(1);
            }
        }
        Command::Init => {
            let path = Path::new(CONFIG_FILE);
            if path.exists() {
                miette::bail!("{CONFIG_FILE} already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created {CONFIG_FILE} with default configuration");
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "vigil", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load `path`, or `.vigil.toml` when present, then overlay the environment.
fn load_config(path: Option<&Path>) -> Result<VigilConfig> {
    let default_path = Path::new(CONFIG_FILE);
    let path = path.or_else(|| default_path.exists().then_some(default_path));
    let mut config = match path {
        Some(path) => {
            debug!(path = %path.display(), "loading configuration");
            VigilConfig::from_file(path)?
        }
        None => VigilConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

fn ensure_valid(config: &VigilConfig) -> Result<()> {
    let problems = config.validate();
    if !problems.is_empty() {
        miette::bail!("invalid configuration:\n  {}", problems.join("\n  "));
    }
    Ok(())
}

/// Wire the GitLab source, analyzer and LLM generator behind the resilience
/// layer. `footer` is appended to every published note.
fn build_processor(config: &VigilConfig, footer: Option<String>) -> Result<UnitProcessor> {
    let invoker = Arc::new(ResilientInvoker::from_config(config));

    let recovery = Arc::new(ErrorRecoveryManager::new());
    register_default_fallbacks(&recovery);

    let degradation = Arc::new(GracefulDegradationRegistry::new());
    let breakers = Arc::clone(&invoker);
    degradation.register_degradable(
        REVIEW_GENERATION,
        move || breakers.is_call_permitted(GENERATOR_DEPENDENCY),
        heuristic_review,
    );

    let source = Arc::new(GitLabClient::new(&config.gitlab)?);
    let analyzer = Arc::new(HeuristicAnalyzer::new()?);
    let llm = LlmReviewGenerator::new(LlmClient::new(&config.llm)?);
    let generator: Arc<dyn Generator> = match footer {
        Some(footer) => Arc::new(FooterGenerator::new(llm, footer)),
        None => Arc::new(llm),
    };

    Ok(UnitProcessor::new(
        source,
        analyzer,
        generator,
        invoker,
        recovery,
        degradation,
    ))
}

fn progress_bar() -> Option<indicatif::ProgressBar> {
    if !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = indicatif::ProgressBar::new(0);
    let style = indicatif::ProgressStyle::with_template(
        "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg} ({elapsed})",
    )
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
    .progress_chars("=> ");
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(120));
    Some(pb)
}

fn progress_callback(pb: indicatif::ProgressBar) -> ProgressCallback {
    Arc::new(move |completed: usize, total: usize, message: &str| {
        pb.set_length(total as u64);
        pb.set_position(completed as u64);
        pb.set_message(message.to_string());
    })
}

fn print_summary(
    summary: &BatchSummary,
    format: OutputFormat,
    results: Option<Vec<UnitResult>>,
) -> Result<()> {
    let analytics = results.as_deref().and_then(AnalyticsAggregator::analyze);
    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "summary": summary,
                "analytics": analytics,
            });
            println!("{}", serde_json::to_string_pretty(&value).into_diagnostic()?);
        }
        OutputFormat::Text => {
            print!("{summary}");
            if let Some(report) = analytics {
                println!("\nAnalytics");
                println!(
                    "  Avg complexity: {:.1}",
                    report.quality.average_complexity_score
                );
                for (risk, count) in &report.quality.risk_distribution {
                    println!("  Risk {risk:<8}  {count}");
                }
                println!(
                    "  Unit time:      {:.2}s fastest, {:.2}s slowest",
                    report.performance.fastest_secs, report.performance.slowest_secs
                );
                println!(
                    "  Publish rate:   {:.1}%",
                    report.success_metrics.publish_rate
                );
                for (bucket, count) in &report.success_metrics.error_categories {
                    println!("  Errors {bucket:<16} {count}");
                }
            } else if results.is_some() {
                println!("\nAnalytics: no results");
            }
        }
    }
    Ok(())
}

fn print_review(
    result: &UnitResult,
    artifact: Option<&ReviewArtifact>,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({ "result": result, "review": artifact });
            println!("{}", serde_json::to_string_pretty(&value).into_diagnostic()?);
        }
        OutputFormat::Text => {
            if let Some(artifact) = artifact {
                print!("{}", format_for_publish(artifact));
            }
            if let Some(error) = &result.error {
                eprintln!("Review of !{} failed: {error}", result.unit_id);
            } else if result.published {
                eprintln!("Posted review to !{}", result.unit_id);
            }
        }
    }
    Ok(())
}

fn print_units(units: &[UnitMetadata], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(units).into_diagnostic()?);
        }
        OutputFormat::Text => {
            if units.is_empty() {
                println!("No merge requests found");
            }
            for unit in units {
                let draft = if unit.draft { " [draft]" } else { "" };
                println!(
                    "!{:<6} {}  {:<16} {}{draft}",
                    unit.id,
                    unit.created_at.format("%Y-%m-%d"),
                    unit.author,
                    unit.title
                );
                if !unit.labels.is_empty() {
                    println!("         labels: {}", unit.labels.join(", "));
                }
            }
        }
    }
    Ok(())
}

fn print_ci_report(report: &CiReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).into_diagnostic()?);
        }
        OutputFormat::Text => {
            let target = format!("{}!{}", report.project, report.merge_request_iid);
            if report.skipped {
                println!("Skipped review of {target}: {}", report.reason);
                return Ok(());
            }
            let Some(result) = &report.result else {
                return Ok(());
            };
            match &result.error {
                Some(error) => println!("Review of {target} failed: {error}"),
                None => {
                    let risk = result
                        .impact
                        .as_ref()
                        .map_or_else(|| "unknown".to_string(), |impact| impact.risk.to_string());
                    println!(
                        "Reviewed {target} ({} mode): risk {risk}, {:.2}s{}",
                        result.mode,
                        result.elapsed_secs,
                        if result.published { ", posted" } else { "" }
                    );
                }
            }
        }
    }
    Ok(())
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("invalid date '{value}': expected YYYY-MM-DD or RFC 3339"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_rfc3339_dates() {
        let day = parse_date("2024-05-01").unwrap();
        assert_eq!(day.to_rfc3339(), "2024-05-01T00:00:00+00:00");
        let instant = parse_date("2024-05-01T12:30:00+02:00").unwrap();
        assert_eq!(instant.to_rfc3339(), "2024-05-01T10:30:00+00:00");
        assert!(parse_date("May 1st").is_err());
    }

    #[test]
    fn default_config_template_parses() {
        let config = VigilConfig::from_toml(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.batch.max_units, 10);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn cli_parses_batch_flags() {
        let cli = Cli::try_parse_from([
            "vigil",
            "batch",
            "group/app",
            "--mode",
            "security",
            "--label",
            "backend",
            "--label",
            "api",
            "--workers",
            "1",
            "--export-format",
            "csv",
        ])
        .unwrap();
        match cli.command {
            Command::Batch {
                project,
                mode,
                labels,
                workers,
                export_format,
                ..
            } => {
                assert_eq!(project, "group/app");
                assert_eq!(mode, Some(ReviewMode::Security));
                assert_eq!(labels, vec!["backend", "api"]);
                assert_eq!(workers, Some(1));
                assert_eq!(export_format, ExportFormat::Csv);
            }
            _ => panic!("expected batch command"),
        }
    }

    #[test]
    fn cli_parses_single_review_targets() {
        let cli = Cli::try_parse_from([
            "vigil",
            "review",
            "https://gitlab.com/acme/app/-/merge_requests/42",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Review {
                target,
                mr,
                publish,
                format,
                ..
            } => {
                assert_eq!(target, "https://gitlab.com/acme/app/-/merge_requests/42");
                assert_eq!(mr, None);
                assert!(!publish);
                assert!(format == OutputFormat::Json);
            }
            _ => panic!("expected review command"),
        }

        let cli =
            Cli::try_parse_from(["vigil", "review", "acme/app", "--mr", "7", "--publish"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Review { mr: Some(7), publish: true, .. }
        ));
    }

    #[test]
    fn cli_parses_list_and_ci() {
        let cli = Cli::try_parse_from(["vigil", "list", "acme/app", "--state", "merged"]).unwrap();
        match cli.command {
            Command::List {
                project,
                state,
                limit,
                ..
            } => {
                assert_eq!(project, "acme/app");
                assert_eq!(state, Some(UnitState::Merged));
                assert_eq!(limit, 20);
            }
            _ => panic!("expected list command"),
        }

        let cli = Cli::try_parse_from(["vigil", "ci", "--mode", "performance"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Ci { mode: Some(ReviewMode::Performance), publish: false, .. }
        ));
    }

    #[test]
    fn default_config_template_keeps_ci_defaults() {
        let config = VigilConfig::from_toml(DEFAULT_CONFIG).unwrap();
        assert!(config.ci.enabled);
        assert!(!config.ci.auto_post);
        assert_eq!(config.ci.skip_on_labels, vec!["skip-review", "no-review"]);
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
