use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use train_dispatch::config::{ExecutorConfig, OrchestratorConfig};
use train_dispatch::metrics::{job_metrics, MetricSeries};
use train_dispatch::node::{Node, DEFAULT_LIST_LIMIT};
use train_dispatch::scheduler::{JobRecord, JobStatus, JobView};
use train_dispatch::shutdown::install_shutdown_handler;
use train_dispatch::store::{DurableStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "train-dispatch")]
#[command(version)]
#[command(about = "Dispatches ML training jobs onto a cluster and tracks their status")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run dispatch workers and the metrics ingestor, reading submissions
    /// as newline-delimited JSON from stdin
    Server(ServerArgs),

    /// Submit one or more training configs and wait until they finish
    Run(RunArgs),

    /// Inspect jobs recorded in the database
    Job {
        #[command(flatten)]
        store: StoreArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct ExecutorArgs {
    /// Create workloads on the cluster. Without it jobs resolve as simulated.
    #[arg(long, env = "USE_K8S")]
    use_k8s: bool,

    /// Trainer container image
    #[arg(long, env = "TRAINER_IMAGE")]
    image: Option<String>,

    /// Namespace workloads are created in
    #[arg(long, env = "K8S_NAMESPACE")]
    namespace: Option<String>,

    /// Environment for the trainer container (KEY=VALUE, repeatable)
    #[arg(long = "trainer-env", value_parser = parse_key_val)]
    trainer_env: Vec<(String, String)>,
}

#[derive(clap::Args, Debug)]
struct StoreArgs {
    /// SQLite database file (in-memory when omitted)
    #[arg(long, env = "DATABASE_PATH")]
    database: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct DispatchArgs {
    /// Number of dispatch workers
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Seconds between workload status queries
    #[arg(long, default_value = "5")]
    poll_interval: u64,

    /// Seconds before a running workload is declared timed out
    #[arg(long, default_value = "7200")]
    poll_budget: u64,

    /// Seconds to wait for workers to stop on shutdown
    #[arg(long, default_value = "10")]
    grace: u64,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    #[command(flatten)]
    executor: ExecutorArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    dispatch: DispatchArgs,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Training configs as JSON objects (e.g. '{"epochs":1}')
    #[arg(required = true)]
    configs: Vec<String>,

    /// Job name applied to every submitted config
    #[arg(long)]
    name: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    #[command(flatten)]
    executor: ExecutorArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    dispatch: DispatchArgs,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// List jobs, newest first
    List {
        /// Maximum number of jobs to show
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
        /// Only show jobs in this status
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Show recorded training metrics for a job
    Metrics {
        /// The job ID metrics were reported under (usually a UUID)
        job_id: String,
        /// Only show this metric
        #[arg(long)]
        name: Option<String>,
    },
}

// =============================================================================
// JSON Input/Output Types
// =============================================================================

#[derive(Deserialize)]
struct Submission {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    config: Value,
}

#[derive(Serialize)]
struct RunOutput {
    job_id: Uuid,
    transitions: Vec<JobStatus>,
    job: JobView,
}

#[derive(Serialize)]
struct MetricsOutput<'a> {
    job_id: &'a str,
    metrics: &'a MetricSeries,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn build_config(
    executor: ExecutorArgs,
    store: StoreArgs,
    dispatch: &DispatchArgs,
) -> OrchestratorConfig {
    let mut executor_config = ExecutorConfig {
        enabled: executor.use_k8s,
        ..ExecutorConfig::default()
    };
    if let Some(image) = executor.image {
        executor_config.image = image;
    }
    if let Some(namespace) = executor.namespace {
        executor_config.namespace = namespace;
    }
    executor_config.env = executor.trainer_env;

    let mut config = OrchestratorConfig::new(executor_config)
        .with_workers(dispatch.workers)
        .with_poll(
            Duration::from_secs(dispatch.poll_interval),
            Duration::from_secs(dispatch.poll_budget),
        );
    if let Some(path) = store.database {
        config = config.with_database_path(path);
    }
    config
}

fn print_view(view: &JobView) {
    println!("Job ID:     {}", view.id);
    if let Some(name) = &view.name {
        println!("Name:       {}", name);
    }
    println!("Status:     {}", view.status);
    if let Some(workload) = &view.workload_ref {
        println!("Workload:   {}", workload);
    }
    if let Some(created) = view.created_at {
        println!("Created:    {}", created.to_rfc3339());
    }
    if let Some(started) = view.started_at {
        println!("Started:    {}", started.to_rfc3339());
    }
    if let Some(finished) = view.finished_at {
        println!("Finished:   {}", finished.to_rfc3339());
    }
    if let Some(error) = &view.error {
        println!("Error:");
        for line in error.lines() {
            println!("  {}", line);
        }
    }
    println!("Config:     {}", view.config);
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let grace = Duration::from_secs(args.dispatch.grace);
    let config = build_config(args.executor, args.store, &args.dispatch);

    tracing::info!(
        executor_enabled = config.executor.enabled,
        namespace = %config.executor.namespace,
        image = %config.executor.image,
        workers = config.dispatch.workers,
        database = ?config.store.database_path,
        "Starting train-dispatch server"
    );

    let mut node = Node::from_config(config)?;
    let token = node.shutdown_token();
    install_shutdown_handler(token.clone());
    node.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    while stdin_open {
        tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Submission>(line) {
                        Ok(submission) => match node.submit(submission.name, submission.config).await {
                            Ok(id) => println!("{}", id),
                            Err(e) => tracing::error!(error = %e, "Submission failed"),
                        },
                        Err(e) => tracing::warn!(error = %e, "Ignoring unreadable submission"),
                    }
                }
                Ok(None) => {
                    tracing::info!("Submissions closed, serving until shutdown signal");
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Stdin read failed, serving until shutdown signal");
                    stdin_open = false;
                }
            },
        }
    }

    token.cancelled().await;
    node.shutdown(grace).await;
    Ok(())
}

async fn run_jobs(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let grace = Duration::from_secs(args.dispatch.grace);
    let configs = args
        .configs
        .iter()
        .map(|raw| serde_json::from_str::<Value>(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let config = build_config(args.executor, args.store, &args.dispatch);

    let mut node = Node::from_config(config)?;
    let token = node.shutdown_token();
    install_shutdown_handler(token.clone());
    node.start();

    let mut transitions: HashMap<Uuid, Vec<JobStatus>> = HashMap::new();
    let mut order = Vec::with_capacity(configs.len());
    for config in configs {
        let id = node.submit(args.name.clone(), config).await?;
        transitions.insert(id, Vec::new());
        order.push(id);
    }

    let mut latest: HashMap<Uuid, JobView> = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for id in &order {
            let view = node.get(*id).await?;
            let seen = transitions.entry(*id).or_default();
            if seen.last() != Some(&view.status) {
                seen.push(view.status);
                if matches!(args.output, OutputFormat::Table) {
                    println!("{} {}", id, view.status);
                }
            }
            latest.insert(*id, view);
        }

        if latest.values().all(|v| v.status.is_terminal()) {
            break;
        }
    }

    node.shutdown(grace).await;

    match args.output {
        OutputFormat::Json => {
            let output: Vec<RunOutput> = order
                .iter()
                .filter_map(|id| {
                    latest.remove(id).map(|job| RunOutput {
                        job_id: *id,
                        transitions: transitions.remove(id).unwrap_or_default(),
                        job,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!();
            for id in &order {
                if let Some(view) = latest.get(id) {
                    let path: Vec<&str> = transitions
                        .get(id)
                        .map(|t| t.iter().map(|s| s.as_str()).collect())
                        .unwrap_or_default();
                    println!("{:<38} {:<10} {}", id, view.status, path.join(" -> "));
                    if let Some(error) = &view.error {
                        println!("    error: {}", error);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Job Command Handlers
// =============================================================================

async fn handle_job_status(
    store: &SqliteStore,
    job_id: Uuid,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(record) = store.get_job(job_id).await? else {
        eprintln!("Error: Job not found: {}", job_id);
        std::process::exit(1);
    };
    let view = JobView::from_record(record);

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Table => print_view(&view),
    }
    Ok(())
}

async fn handle_job_list(
    store: &SqliteStore,
    limit: usize,
    status: Option<JobStatus>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs: Vec<JobRecord> = store.list_jobs(limit, status).await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<38} {:<10} {:<20} CREATED", "JOB ID", "STATUS", "NAME");
            println!("{}", "-".repeat(96));
            for job in &jobs {
                let name = job.name.as_deref().unwrap_or("-");
                let name_display = if name.chars().count() > 20 {
                    format!("{}...", name.chars().take(17).collect::<String>())
                } else {
                    name.to_string()
                };
                println!(
                    "{:<38} {:<10} {:<20} {}",
                    job.id,
                    job.status,
                    name_display,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!();
            println!("Showing {} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_job_metrics(
    store: &SqliteStore,
    job_id: String,
    name: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let series = job_metrics(store, &job_id, name.as_deref()).await?;

    match output_format {
        OutputFormat::Json => {
            let output = MetricsOutput {
                job_id: &job_id,
                metrics: &series,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if series.is_empty() {
                println!("No metrics recorded.");
                return Ok(());
            }
            for (metric, samples) in &series {
                println!("{}", metric);
                println!("  {:<10} {:<10} VALUE", "STEP", "EPOCH");
                for sample in samples {
                    println!("  {:<10} {:<10.3} {}", sample.step, sample.epoch, sample.value);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Run(run_args) => {
            run_jobs(run_args).await?;
        }
        Commands::Job {
            store,
            output,
            command,
        } => {
            let Some(path) = store.database else {
                return Err("job commands need --database or DATABASE_PATH".into());
            };
            let store = SqliteStore::open(&path)?;

            match command {
                JobCommands::Status { job_id } => {
                    handle_job_status(&store, job_id, &output).await?;
                }
                JobCommands::List { limit, status } => {
                    handle_job_list(&store, limit, status, &output).await?;
                }
                JobCommands::Metrics { job_id, name } => {
                    handle_job_metrics(&store, job_id, name, &output).await?;
                }
            }
        }
    }

    Ok(())
}
