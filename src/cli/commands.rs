//! CLI command definitions for contentforge.
//!
//! This module provides the command-line interface for running the
//! orchestrator and for managing content jobs in the SQLite job store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::metrics::{export_metrics, init_metrics};
use crate::notify::{TracingNotifier, WebhookNotifier};
use crate::pipeline::{
    Assembler, Collaborators, CommandStage, MediaProducer, Notifier, Orchestrator,
    OrchestratorConfig, Publisher, Stage, UnconfiguredStage,
};
use crate::scheduler::{ContentJob, JobId, JobStatus, NewContentJob, TransitionRecord};
use crate::storage::{JobStore, SqliteJobStore};

/// Scheduled content pipeline orchestrator.
#[derive(Parser)]
#[command(name = "contentforge")]
#[command(about = "Schedule, produce and publish content jobs")]
#[command(version)]
#[command(
    long_about = "contentforge picks up content jobs once their scheduled time has passed, runs them through produce, assemble and publish commands, and retries failures with exponential backoff.\n\nExample usage:\n  contentforge submit \"Morning news\" --at 2026-01-01T08:00:00Z\n  contentforge run --produce-cmd ./produce.sh --assemble-cmd ./assemble.sh --publish-cmd ./publish.sh"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite connection URL of the job store.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the orchestrator until interrupted.
    Run(RunArgs),

    /// Create a content job.
    #[command(alias = "add")]
    Submit(SubmitArgs),

    /// List content jobs.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show one content job and its status history.
    Show(ShowArgs),

    /// Cancel a content job that has not finished.
    Cancel(CancelArgs),
}

/// Arguments for `contentforge run`.
///
/// Unset options fall back to the `CONTENTFORGE_*` environment variables and
/// then to the built-in defaults.
#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Seconds between readiness polls.
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Maximum number of jobs processed at once.
    #[arg(short = 'c', long)]
    pub max_concurrent: Option<usize>,

    /// Failed attempts after which a job fails for good.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Seconds before the first retry; doubled for each further retry.
    #[arg(long)]
    pub base_backoff: Option<u64>,

    /// Upper bound in seconds on every stage call.
    #[arg(long)]
    pub stage_timeout: Option<u64>,

    /// Seconds to wait for in-flight jobs on shutdown.
    #[arg(long)]
    pub shutdown_timeout: Option<u64>,

    /// Root directory for per-job work directories.
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Leave jobs interrupted by a previous run untouched.
    #[arg(long)]
    pub no_recover: bool,

    /// Command implementing the produce stage (split on whitespace, no quoting).
    #[arg(long)]
    pub produce_cmd: Option<String>,

    /// Command implementing the assemble stage (split on whitespace, no quoting).
    #[arg(long)]
    pub assemble_cmd: Option<String>,

    /// Command implementing the publish stage (split on whitespace, no quoting).
    #[arg(long)]
    pub publish_cmd: Option<String>,

    /// Webhook receiving job notifications.
    #[arg(long)]
    pub webhook: Option<String>,

    /// Print Prometheus metrics after shutdown.
    #[arg(long)]
    pub print_metrics: bool,

    /// Output the final counters as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `contentforge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Title of the content.
    pub title: String,

    /// Longer description handed to the stages.
    #[arg(short = 'd', long, default_value = "")]
    pub description: String,

    /// Content category.
    #[arg(short = 'c', long, default_value = "")]
    pub category: String,

    /// Expected duration of the content in seconds.
    #[arg(long, default_value = "0")]
    pub duration: u32,

    /// When the job becomes eligible (RFC 3339). Defaults to now.
    #[arg(long, conflicts_with = "delay")]
    pub at: Option<String>,

    /// Seconds from now until the job becomes eligible.
    #[arg(long)]
    pub delay: Option<u64>,

    /// Publish this existing file instead of producing new media.
    #[arg(long)]
    pub existing_artifact: Option<PathBuf>,

    /// Extra metadata entries as key=value (values may be JSON).
    #[arg(short = 'm', long = "meta")]
    pub metadata: Vec<String>,

    /// Output the created job as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `contentforge list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only list jobs in this status.
    #[arg(short = 's', long)]
    pub status: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `contentforge show`.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Job id.
    pub id: JobId,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `contentforge cancel`.
#[derive(Parser, Debug)]
pub struct CancelArgs {
    /// Job id.
    pub id: JobId,

    /// Output JSON.
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
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command {
        Commands::Run(args) => run_orchestrator_command(config, args).await,
        Commands::Submit(args) => run_submit_command(&config, args).await,
        Commands::List(args) => run_list_command(&config, args).await,
        Commands::Show(args) => run_show_command(&config, args).await,
        Commands::Cancel(args) => run_cancel_command(&config, args).await,
    }
}

async fn open_store(config: &OrchestratorConfig) -> anyhow::Result<SqliteJobStore> {
    let store = SqliteJobStore::connect(&config.database_url).await?;
    store.run_migrations().await?;
    Ok(store)
}

// ============================================================================
// Run
// ============================================================================

/// Applies `run` flags on top of the environment configuration.
fn apply_run_args(mut config: OrchestratorConfig, args: &RunArgs) -> anyhow::Result<OrchestratorConfig> {
    if let Some(secs) = args.poll_interval {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(max) = args.max_concurrent {
        config.max_concurrent = max;
    }
    if let Some(retries) = args.max_retries {
        config.max_retries = retries;
    }
    if let Some(secs) = args.base_backoff {
        config.base_backoff = Duration::from_secs(secs);
    }
    if let Some(secs) = args.stage_timeout {
        config.stage_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.shutdown_timeout {
        config.shutdown_timeout = Duration::from_secs(secs);
    }
    if let Some(dir) = &args.temp_dir {
        config.temp_dir = dir.clone();
    }
    if args.no_recover {
        config.recover_interrupted = false;
    }
    if args.produce_cmd.is_some() {
        config.produce_command = args.produce_cmd.clone();
    }
    if args.assemble_cmd.is_some() {
        config.assemble_command = args.assemble_cmd.clone();
    }
    if args.publish_cmd.is_some() {
        config.publish_command = args.publish_cmd.clone();
    }
    if args.webhook.is_some() {
        config.notify_webhook = args.webhook.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Builds command-backed collaborators from the configuration.
fn build_collaborators(config: &OrchestratorConfig) -> anyhow::Result<Collaborators> {
    let producer: Arc<dyn MediaProducer> = match stage_command(Stage::Produce, config.produce_command.as_deref()) {
        Some(stage) => Arc::new(stage),
        None => Arc::new(UnconfiguredStage(Stage::Produce)),
    };
    let assembler: Arc<dyn Assembler> = match stage_command(Stage::Assemble, config.assemble_command.as_deref()) {
        Some(stage) => Arc::new(stage),
        None => Arc::new(UnconfiguredStage(Stage::Assemble)),
    };
    let publisher: Arc<dyn Publisher> = match stage_command(Stage::Publish, config.publish_command.as_deref()) {
        Some(stage) => Arc::new(stage),
        None => Arc::new(UnconfiguredStage(Stage::Publish)),
    };

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(TracingNotifier),
    };

    Ok(Collaborators::new(producer, assembler, publisher).with_notifier(notifier))
}

fn stage_command(stage: Stage, command_line: Option<&str>) -> Option<CommandStage> {
    let command = command_line.and_then(|line| CommandStage::from_command_line(stage, line));
    if command.is_none() {
        warn!(stage = %stage, "No command configured; jobs reaching this stage will fail");
    }
    command
}

async fn run_orchestrator_command(config: OrchestratorConfig, args: RunArgs) -> anyhow::Result<()> {
    let config = apply_run_args(config, &args)?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let store = Arc::new(open_store(&config).await?);
    let collaborators = build_collaborators(&config)?;
    let (orchestrator, handle) = Orchestrator::new(config, store, collaborators)?;
    info!(run_id = %orchestrator.run_id(), "Starting orchestrator; press Ctrl-C to stop");

    let mut run = orchestrator.spawn();
    let stats = tokio::select! {
        result = &mut run => result?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Interrupt received, shutting down");
            handle.shutdown().await?;
            run.await?
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Orchestrator stopped");
        println!("  Admitted:  {}", stats.admitted);
        println!("  Completed: {}", stats.completed);
        println!("  Failed:    {}", stats.failed);
        println!("  Cancelled: {}", stats.cancelled);
        println!("  Retried:   {}", stats.retried);
        println!("  Recovered: {}", stats.recovered);
        println!("  Peak active: {}", stats.peak_active);
    }

    if args.print_metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}

// ============================================================================
// Job management
// ============================================================================

/// Parses the schedule time from `--at` or `--delay`.
fn schedule_time(at: Option<&str>, delay: Option<u64>, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    if let Some(raw) = at {
        let parsed = DateTime::parse_from_rfc3339(raw)
            .map_err(|e| anyhow::anyhow!("Invalid --at '{}': {}", raw, e))?;
        return Ok(parsed.with_timezone(&Utc));
    }
    let Some(secs) = delay else {
        return Ok(now);
    };
    let offset = i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| anyhow::anyhow!("--delay {} is out of range", secs))?;
    now.checked_add_signed(offset)
        .ok_or_else(|| anyhow::anyhow!("--delay {} is out of range", secs))
}

/// Parses a `key=value` metadata entry; the value is JSON when it parses as such.
fn parse_metadata_entry(raw: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Metadata entry '{}' is not key=value", raw))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Metadata entry '{}' has an empty key", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_new_job(args: &SubmitArgs, now: DateTime<Utc>) -> anyhow::Result<NewContentJob> {
    let mut job = NewContentJob::new(
        args.title.clone(),
        schedule_time(args.at.as_deref(), args.delay, now)?,
    )
    .with_description(args.description.clone())
    .with_category(args.category.clone())
    .with_expected_duration(args.duration);

    for raw in &args.metadata {
        let (key, value) = parse_metadata_entry(raw)?;
        job = job.with_metadata(&key, value);
    }

    if let Some(path) = &args.existing_artifact {
        if !path.is_file() {
            warn!(path = %path.display(), "Existing artifact is not a file; the job will be produced from scratch");
        }
        job = job.with_existing_artifact(path);
    }
    Ok(job)
}

async fn run_submit_command(config: &OrchestratorConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let new_job = build_new_job(&args, Utc::now())?;
    let store = open_store(config).await?;
    let job = store.create(new_job).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        println!("Created job {} \"{}\"", job.id, job.title);
        println!("  Scheduled: {}", job.schedule_time.to_rfc3339());
    }
    Ok(())
}

async fn run_list_command(config: &OrchestratorConfig, args: ListArgs) -> anyhow::Result<()> {
    let status = args
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let store = open_store(config).await?;
    let jobs = store.list(status).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    println!("{:>6}  {:<11}  {:<25}  {:>7}  TITLE", "ID", "STATUS", "SCHEDULED", "RETRIES");
    for job in &jobs {
        println!(
            "{:>6}  {:<11}  {:<25}  {:>7}  {}",
            job.id,
            job.status,
            job.schedule_time.to_rfc3339(),
            job.retry_count(),
            job.title
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ShowOutput {
    job: ContentJob,
    history: Vec<TransitionRecord>,
}

async fn run_show_command(config: &OrchestratorConfig, args: ShowArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let job = store.get(args.id).await?;
    let history = store.history(args.id).await?;

    if args.json {
        let output = ShowOutput { job, history };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Job {}: {}", job.id, job.title);
    println!("  Status:    {} ({})", job.status, job.status.progress_label());
    println!("  Scheduled: {}", job.schedule_time.to_rfc3339());
    if !job.category.is_empty() {
        println!("  Category:  {}", job.category);
    }
    println!("  Retries:   {}", job.retry_count());
    if let Some(error) = job.last_error() {
        println!("  Last error: {}", error);
    }
    if let Some(external_id) = job.external_id() {
        println!("  External id: {}", external_id);
    }
    if !job.metadata.is_empty() {
        println!("  Metadata:");
        for (key, value) in &job.metadata {
            println!("    {}: {}", key, value);
        }
    }
    if !history.is_empty() {
        println!("  History:");
        for record in &history {
            println!("    {}  {} -> {}", record.at.to_rfc3339(), record.from, record.to);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CancelOutput {
    job_id: JobId,
    cancelled: bool,
    status: JobStatus,
}

async fn run_cancel_command(config: &OrchestratorConfig, args: CancelArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let job = store.get(args.id).await?;

    let output = if job.status.is_terminal() {
        CancelOutput {
            job_id: job.id,
            cancelled: false,
            status: job.status,
        }
    } else {
        store.set_status(job.id, JobStatus::Cancelled).await?;
        info!(job_id = job.id, previous_status = %job.status, "Cancelled job");
        CancelOutput {
            job_id: job.id,
            cancelled: true,
            status: JobStatus::Cancelled,
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if output.cancelled {
        println!("Cancelled job {}", output.job_id);
    } else {
        println!("Job {} already finished ({})", output.job_id, output.status);
    }
    Ok(())
}
