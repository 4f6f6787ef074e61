//! CLI command definitions for codebench.
//!
//! `run` executes an evaluation run and streams one line per attempt;
//! the remaining commands inspect the task catalog and stored runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::catalog::{TaskCatalog, TaskSelection};
use crate::llm::{LiteLlmClient, ModelGateway, PricingTable, ProviderGateway, ReplayGateway};
use crate::metrics::{export_metrics, init_metrics};
use crate::progress::{ProgressEvent, RunRegistry};
use crate::prompts::PromptBuilder;
use crate::runner::{run_id_for, HarnessSettings, RunConfig, RunScheduler, RunSummary};
use crate::storage::{MemoryRunStore, RunStore, SqliteRunStore};

/// Default SQLite database for stored runs.
const DEFAULT_DATABASE_URL: &str = "sqlite://codebench.db";

/// Evaluate code-generation models against a task catalog.
#[derive(Parser)]
#[command(name = "codebench")]
#[command(about = "Evaluate code-generation models against a catalog of patch tasks")]
#[command(version)]
#[command(
    long_about = "codebench sends each task's instructions and workspace to one or more models, applies the returned diff in a private sandbox and runs the task's eval command.\n\nExample usage:\n  codebench run -m openai/gpt-4o --tasks all --samples 3"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run an evaluation.
    Run(Box<RunArgs>),

    /// Print the prompts a run would send, without calling any model.
    Prompt(PromptArgs),

    /// List tasks in the catalog.
    Tasks(TasksArgs),

    /// Inspect stored runs.
    Runs(RunsArgs),

    /// Best run per model across stored runs.
    Leaderboard(LeaderboardArgs),
}

/// Where stored runs live.
#[derive(clap::Args, Debug, Clone)]
pub struct StoreArgs {
    /// SQLite database URL.
    #[arg(long, env = "CODEBENCH_DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,
}

/// Arguments for `codebench run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML run description; flags given here override its values.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Model ids (repeat or comma-separate).
    #[arg(short = 'm', long = "model", value_delimiter = ',')]
    pub models: Vec<String>,

    /// "all" or a comma-separated list of task ids.
    #[arg(short = 't', long)]
    pub tasks: Option<String>,

    /// Samples per (task, model).
    #[arg(short = 's', long)]
    pub samples: Option<u32>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Apply the hunks that fit when a diff does not apply cleanly.
    #[arg(long)]
    pub allow_incomplete_diffs: bool,

    /// Accept whole-file replacements when the response holds no usable diff.
    #[arg(long)]
    pub allow_diff_rewrite_fallback: bool,

    /// Show the task's test files to the model.
    #[arg(long)]
    pub include_tests: bool,

    /// Pip-install each task's requirements.txt inside its sandbox.
    #[arg(long)]
    pub install_deps: bool,

    /// Replay this stored response instead of calling a model.
    #[arg(long)]
    pub response_file: Option<PathBuf>,

    /// Run id; generated when omitted.
    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long, env = "CODEBENCH_TASKS_ROOT", default_value = "tasks")]
    pub tasks_root: PathBuf,

    #[arg(long, env = "CODEBENCH_RUNS_ROOT", default_value = "runs")]
    pub runs_root: PathBuf,

    /// Do not write run artifacts.
    #[arg(long)]
    pub no_artifacts: bool,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Keep the summary in memory only.
    #[arg(long)]
    pub no_db: bool,

    /// Concurrent attempts.
    #[arg(long, env = "CODEBENCH_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    /// Cap on captured characters per eval output stream.
    #[arg(long)]
    pub max_log_chars: Option<usize>,

    /// Context lines a hunk may ignore at each edge.
    #[arg(long)]
    pub patch_fuzz: Option<usize>,

    /// OpenRouter API key.
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// OpenAI-compatible API base URL.
    #[arg(long, env = "CODEBENCH_API_BASE", default_value = crate::llm::DEFAULT_API_BASE)]
    pub api_base: String,

    /// Skip fetching per-token pricing.
    #[arg(long)]
    pub no_pricing: bool,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print the summary as JSON instead of attempt lines.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `codebench prompt`.
#[derive(Parser, Debug)]
pub struct PromptArgs {
    /// "all" or a comma-separated list of task ids.
    #[arg(short = 't', long, default_value = "all")]
    pub tasks: String,

    #[arg(long)]
    pub include_tests: bool,

    #[arg(long, env = "CODEBENCH_TASKS_ROOT", default_value = "tasks")]
    pub tasks_root: PathBuf,
}

/// Arguments for `codebench tasks`.
#[derive(Parser, Debug)]
pub struct TasksArgs {
    #[arg(long, env = "CODEBENCH_TASKS_ROOT", default_value = "tasks")]
    pub tasks_root: PathBuf,

    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `codebench runs`.
#[derive(Parser, Debug)]
pub struct RunsArgs {
    #[command(subcommand)]
    pub command: RunsSubcommand,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Stored-run subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum RunsSubcommand {
    /// Most recent runs first.
    List {
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        #[arg(short = 'j', long)]
        json: bool,
    },

    /// Print a stored summary as JSON.
    Show { run_id: String },

    /// Delete every run that evaluated a model.
    Delete {
        #[arg(short = 'm', long)]
        model: String,
    },
}

/// Arguments for `codebench leaderboard`.
#[derive(Parser, Debug)]
pub struct LeaderboardArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_eval_command(*args).await,
        Commands::Prompt(args) => run_prompt_command(args),
        Commands::Tasks(args) => run_tasks_command(args),
        Commands::Runs(args) => run_runs_command(args).await,
        Commands::Leaderboard(args) => run_leaderboard_command(args).await,
    }
}

// ============================================================================
// Run Command
// ============================================================================

/// Merge the optional YAML file with the flags.
fn resolve_run_config(args: &RunArgs) -> anyhow::Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load run config {}", path.display()))?,
        None => RunConfig::new(Vec::<String>::new()),
    };

    if !args.models.is_empty() {
        config.models = args.models.clone();
    }
    if let Some(tasks) = &args.tasks {
        config.tasks = TaskSelection::parse(tasks);
    }
    if let Some(samples) = args.samples {
        config.samples = samples;
    }
    if let Some(temperature) = args.temperature {
        config.temperature = temperature;
    }
    if let Some(max_tokens) = args.max_tokens {
        config.max_tokens = max_tokens;
    }
    config.allow_incomplete_diffs |= args.allow_incomplete_diffs;
    config.allow_diff_rewrite_fallback |= args.allow_diff_rewrite_fallback;
    config.include_tests |= args.include_tests;
    config.install_deps |= args.install_deps;
    if let Some(path) = &args.response_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read response file {}", path.display()))?;
        config.response_text = Some(text);
    }
    if args.run_id.is_some() {
        config.run_id = args.run_id.clone();
    }

    config.validate().map_err(|e| anyhow::anyhow!("Invalid run configuration: {}", e))?;
    Ok(config)
}

fn resolve_settings(args: &RunArgs) -> HarnessSettings {
    let mut settings = HarnessSettings::default()
        .with_tasks_root(args.tasks_root.clone())
        .with_runs_root((!args.no_artifacts).then(|| args.runs_root.clone()));
    if let Some(n) = args.max_concurrency {
        settings = settings.with_max_concurrency(n);
    }
    if let Some(n) = args.max_log_chars {
        settings = settings.with_max_log_chars(n);
    }
    if let Some(fuzz) = args.patch_fuzz {
        settings = settings.with_patch_fuzz(fuzz);
    }
    settings
}

async fn build_gateway(
    args: &RunArgs,
    config: &RunConfig,
) -> anyhow::Result<(Arc<dyn ModelGateway>, PricingTable)> {
    if let Some(text) = &config.response_text {
        info!("Replaying stored response instead of calling a model");
        let gateway: Arc<dyn ModelGateway> = Arc::new(ReplayGateway::new(text.clone()));
        return Ok((gateway, PricingTable::new()));
    }

    let api_key = args.api_key.clone().filter(|k| !k.trim().is_empty()).ok_or_else(|| {
        anyhow::anyhow!("No API key. Pass --api-key or set OPENROUTER_API_KEY.")
    })?;
    let client = LiteLlmClient::new(args.api_base.clone(), Some(api_key))?;
    let pricing = if args.no_pricing {
        PricingTable::new()
    } else {
        PricingTable::fetch(&client, &config.models).await
    };

    let gateway: Arc<dyn ModelGateway> =
        Arc::new(ProviderGateway::new(Arc::new(client), "openrouter").with_pricing(pricing.clone()));
    Ok((gateway, pricing))
}

async fn open_store(store: &StoreArgs, in_memory: bool) -> anyhow::Result<Arc<dyn RunStore>> {
    let store: Arc<dyn RunStore> = if in_memory {
        Arc::new(MemoryRunStore::new())
    } else {
        let db = SqliteRunStore::connect(&store.database_url)
            .await
            .with_context(|| format!("Failed to open run store {}", store.database_url))?;
        Arc::new(db)
    };
    Ok(store)
}

async fn run_eval_command(args: RunArgs) -> anyhow::Result<()> {
    let config = resolve_run_config(&args)?;
    let settings = resolve_settings(&args);
    let (gateway, pricing) = build_gateway(&args, &config).await?;
    let store = open_store(&args.store, args.no_db).await?;

    if args.metrics_file.is_some() {
        init_metrics()?;
    }

    let scheduler = RunScheduler::new(settings, gateway, store).with_pricing(pricing);
    let registry = RunRegistry::new();
    let run_id = run_id_for(&config);
    let dispatcher = registry.register(&run_id)?;

    let json = args.json;
    let mut events = dispatcher.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if !json {
                print_event(&event);
            }
        }
    });

    let cancel = scheduler.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling run");
            cancel.cancel();
        }
    });

    let result = scheduler.run(config, dispatcher).await;
    interrupt.abort();
    if let Err(e) = printer.await {
        warn!(error = %e, "Progress printer failed");
    }
    registry.remove(&run_id);

    if let Some(path) = &args.metrics_file {
        write_metrics_file(path)?;
    }

    let summary = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn write_metrics_file(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, export_metrics())
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    info!(path = %path.display(), "Wrote metrics");
    Ok(())
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Init {
            run_id,
            models,
            tasks,
            samples,
            provider,
        } => {
            println!("\n=== Run {} ===", run_id);
            println!("Provider: {}", provider);
            println!("Models:   {}", models.join(", "));
            println!("Tasks:    {}", tasks.len());
            println!("Samples:  {}", samples);
            println!();
        }
        ProgressEvent::Attempt(attempt) => {
            let mut line = format!(
                "  [{:<5}] {} {} #{} {:.1}s",
                attempt.status,
                attempt.task_id,
                attempt.model,
                attempt.sample_index,
                attempt.duration_seconds
            );
            if let Some(cost) = attempt.cost_usd {
                line.push_str(&format!(" ${:.4}", cost));
            }
            if let Some(error) = &attempt.error {
                line.push_str(&format!(" ({})", error.lines().next().unwrap_or_default()));
            }
            println!("{}", line);
        }
        ProgressEvent::Complete { .. } => {}
        ProgressEvent::Error { message } => {
            eprintln!("\nRun failed: {}", message);
        }
    }
}

fn print_summary(summary: &RunSummary) {
    let overall = &summary.metrics.overall;
    println!("\n=== Results ===");
    println!("Attempts:     {}", overall.attempts);
    println!(
        "Status:       {} pass / {} fail / {} error",
        overall.status_counts.pass, overall.status_counts.fail, overall.status_counts.error
    );
    println!("Accuracy:     {:.1}%", overall.macro_model_accuracy * 100.0);
    println!(
        "Tokens:       {} prompt / {} completion",
        summary.token_usage.prompt_tokens, summary.token_usage.completion_tokens
    );
    println!("Cost:         ${:.6}", summary.token_usage.total_cost_usd);
    println!("Attempt time: {:.1}s", summary.timing.total_duration_seconds);
    println!();

    for model in &summary.models {
        let pct = |v: Option<&Option<f64>>| match v.copied().flatten() {
            Some(v) => format!("{:.1}%", v * 100.0),
            None => "-".to_string(),
        };
        println!(
            "  {} accuracy={} pass@1={} pass@k={}",
            model,
            pct(summary.metrics.model_accuracy.get(model)),
            pct(summary.metrics.pass_at_1.get(model)),
            pct(summary.metrics.pass_at_k.get(model)),
        );
    }
    if let Some(dir) = &summary.run_dir {
        println!("\nArtifacts: {}", dir);
    }
}

// ============================================================================
// Catalog Commands
// ============================================================================

fn run_prompt_command(args: PromptArgs) -> anyhow::Result<()> {
    let catalog = TaskCatalog::open(&args.tasks_root)?;
    let tasks = catalog.resolve(&TaskSelection::parse(&args.tasks))?;
    let builder = PromptBuilder::new(args.include_tests);
    for task in &tasks {
        let prompt = builder.build(task)?;
        println!("=== {} ===\n{}\n", task.id, prompt);
    }
    Ok(())
}

fn run_tasks_command(args: TasksArgs) -> anyhow::Result<()> {
    let catalog = TaskCatalog::open(&args.tasks_root)?;
    let tasks = catalog.resolve(&TaskSelection::All)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    for task in &tasks {
        println!(
            "{:<32} {:<10} {:>5}s  {}",
            task.id,
            task.language,
            task.timeout_seconds,
            task.eval_command().display()
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}

// ============================================================================
// Stored Run Commands
// ============================================================================

async fn run_runs_command(args: RunsArgs) -> anyhow::Result<()> {
    let store = open_store(&args.store, false).await?;
    match args.command {
        RunsSubcommand::List { limit, json } => {
            let runs = store.list_runs(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
                return Ok(());
            }
            for run in &runs {
                println!(
                    "{:<36} {}  acc={:>5.1}%  cost=${:.4}  time={:.1}s  errors={}  {}",
                    run.run_id,
                    run.timestamp_utc.format("%Y-%m-%d %H:%M:%S"),
                    run.accuracy * 100.0,
                    run.total_cost_usd,
                    run.total_duration_seconds,
                    run.error_count,
                    run.models.join(",")
                );
            }
        }
        RunsSubcommand::Show { run_id } => match store.get_run(&run_id).await? {
            Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
            None => anyhow::bail!("Run '{}' not found", run_id),
        },
        RunsSubcommand::Delete { model } => {
            let removed = store.delete_runs_for_model(&model).await?;
            println!("Removed {} run(s) for {}", removed, model);
        }
    }
    Ok(())
}

async fn run_leaderboard_command(args: LeaderboardArgs) -> anyhow::Result<()> {
    let store = open_store(&args.store, false).await?;
    let rows = store.leaderboard().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    let fmt = |v: Option<f64>, scale: f64, suffix: &str| match v {
        Some(v) => format!("{:.2}{}", v * scale, suffix),
        None => "-".to_string(),
    };
    for (rank, row) in rows.iter().enumerate() {
        println!(
            "{:>3}. {:<40} acc={:>7}  cost={:>9}  time={:>8}  runs={}",
            rank + 1,
            row.model,
            fmt(row.best_accuracy, 100.0, "%"),
            fmt(row.cost_at_best, 1.0, "$"),
            fmt(row.duration_at_best, 1.0, "s"),
            row.runs
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    fn parse_run(args: &[&str]) -> RunArgs {
        let mut argv = vec!["codebench", "run"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).expect("should parse").command {
            Commands::Run(args) => *args,
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let args = parse_run(&["-m", "m1"]);
        assert_eq!(args.models, vec!["m1"]);
        assert!(args.tasks.is_none());
        assert!(!args.no_db);
        assert!(!args.json);

        let config = resolve_run_config(&args).unwrap();
        assert_eq!(config.tasks, TaskSelection::All);
        assert_eq!(config.samples, 1);
    }

    #[test]
    fn test_models_comma_separated_and_repeated() {
        let args = parse_run(&["-m", "a/m1,b/m2", "--model", "c/m3"]);
        assert_eq!(args.models, vec!["a/m1", "b/m2", "c/m3"]);
    }

    #[test]
    fn test_flags_override_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "models: [m1]\ntasks: [t1, t2]\nsamples: 3\ninclude_tests: true").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = parse_run(&["--config", &path, "--samples", "5", "-t", "t9"]);
        let config = resolve_run_config(&args).unwrap();
        assert_eq!(config.models, vec!["m1"]);
        assert_eq!(config.samples, 5);
        assert_eq!(config.tasks, TaskSelection::Ids(vec!["t9".into()]));
        assert!(config.include_tests);
        assert!(!config.install_deps);
    }

    #[test]
    fn test_install_deps_flag() {
        let config = resolve_run_config(&parse_run(&["-m", "m1", "--install-deps"])).unwrap();
        assert!(config.install_deps);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let args = parse_run(&["--samples", "2"]);
        assert!(resolve_run_config(&args).is_err());
    }

    #[test]
    fn test_settings_from_flags() {
        let args = parse_run(&["-m", "m1", "--no-artifacts", "--max-concurrency", "0", "--patch-fuzz", "0"]);
        let settings = resolve_settings(&args);
        assert!(settings.runs_root.is_none());
        assert_eq!(settings.max_concurrency, 1);
        assert_eq!(settings.patch_fuzz, 0);
    }

    #[test]
    fn test_runs_subcommands_parse() {
        let cli = Cli::try_parse_from(["codebench", "runs", "show", "run_x"]).unwrap();
        match cli.command {
            Commands::Runs(args) => {
                assert!(matches!(args.command, RunsSubcommand::Show { ref run_id } if run_id == "run_x"));
            }
            _ => panic!("Expected Runs command"),
        }
    }
}
