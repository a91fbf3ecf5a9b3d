//! CLI command definitions for fold-forge.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::config::Settings;
use crate::execution::{DockerClient, IsolatedRunner};
use crate::job::{JobFilter, JobStatus};
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::PipelineOrchestrator;
use crate::scheduler::{Dispatcher, MemoryTaskQueue, RedisTaskQueue, TaskQueue, WorkerPool};
use crate::service::JobService;
use crate::stages::{StageContext, StageSet};
use crate::storage::{JobStore, LocalObjectStore, MemoryJobStore, ObjectStore, PgJobStore};

/// Structural-biology job orchestration.
#[derive(Parser)]
#[command(name = "fold-forge")]
#[command(about = "Run design, backbone and structure prediction models as tracked jobs")]
#[command(version)]
#[command(
    long_about = "fold-forge runs structural-biology model chains (design, backbone generation, structure prediction) as isolated containers and tracks every job through a strict lifecycle.\n\nSettings are read from the environment (DATABASE_URL, REDIS_URL, STORAGE_PATH, ...).\n\nExample usage:\n  fold-forge migrate\n  fold-forge worker --workers 2\n  fold-forge submit --input target.pdb --pipeline full_chain --models diffab,af2"
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
    /// Apply pending database migrations.
    Migrate,

    /// Run a worker pool until interrupted.
    Worker(WorkerArgs),

    /// Create a job from an input file and queue it.
    Submit(SubmitArgs),

    /// Show a job record.
    Status(JobArgs),

    /// Show download links and metrics of a completed job.
    Results(ResultsArgs),

    /// List recent jobs.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Cancel a job, force-killing its container if it is running.
    Cancel(JobArgs),

    /// Re-queue a failed job.
    Retry(JobArgs),

    /// Delete a job with its stored objects.
    Delete(JobArgs),
}

/// Arguments for `fold-forge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers; overrides NUM_WORKERS.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Write a Prometheus text snapshot here when the worker stops.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

/// Arguments for `fold-forge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Structure file to process (.pdb, .cif or .ent).
    #[arg(short = 'i', long)]
    pub input: PathBuf,

    /// Pipeline type (design_only, backbone_only, prediction_only, full_chain).
    #[arg(short = 'p', long, default_value = "full_chain")]
    pub pipeline: String,

    /// Comma-separated models for a full chain (diffab, rfdiffusion, af2).
    #[arg(short = 'm', long, value_delimiter = ',')]
    pub models: Vec<String>,

    /// Job configuration as a JSON object.
    #[arg(short = 'c', long)]
    pub config: Option<String>,

    /// Run the job in this process with in-memory bookkeeping and queue.
    #[arg(long)]
    pub in_memory: bool,
}

/// Arguments for commands that take a single job id.
#[derive(Parser, Debug)]
pub struct JobArgs {
    /// Job identifier.
    pub job_id: String,
}

/// Arguments for `fold-forge results`.
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    /// Job identifier.
    pub job_id: String,

    /// Lifetime of the download links in seconds.
    #[arg(long, default_value = "3600")]
    pub ttl: u64,
}

/// Arguments for `fold-forge list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only jobs in this status.
    #[arg(short = 's', long)]
    pub status: Option<String>,

    /// Only jobs with this pipeline type.
    #[arg(short = 'p', long)]
    pub pipeline: Option<String>,

    /// Maximum number of jobs to show.
    #[arg(short = 'n', long, default_value = "50")]
    pub limit: usize,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run a parsed command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Invalid settings")?;

    match cli.command {
        Commands::Migrate => run_migrate_command(&settings).await,
        Commands::Worker(args) => run_worker_command(settings, args).await,
        Commands::Submit(args) if args.in_memory => run_local_submit_command(settings, args).await,
        Commands::Submit(args) => run_submit_command(settings, args).await,
        Commands::Status(args) => {
            let runtime = Runtime::connect(settings).await?;
            print_json(&runtime.service.status(&args.job_id).await?)
        }
        Commands::Results(args) => {
            let runtime = Runtime::connect(settings).await?;
            let results = runtime
                .service
                .results(&args.job_id, Some(Duration::from_secs(args.ttl)))
                .await?;
            print_json(&results)
        }
        Commands::List(args) => run_list_command(settings, args).await,
        Commands::Cancel(args) => {
            let runtime = Runtime::connect(settings).await?;
            let status = runtime.service.cancel(&args.job_id).await?;
            println!("{} {}", args.job_id, status);
            Ok(())
        }
        Commands::Retry(args) => {
            let runtime = Runtime::connect(settings).await?;
            let handle = runtime.service.retry(&args.job_id).await?;
            println!("{} queued as task {}", args.job_id, handle);
            Ok(())
        }
        Commands::Delete(args) => {
            let runtime = Runtime::connect(settings).await?;
            if runtime.service.delete(&args.job_id).await? {
                println!("{} deleted", args.job_id);
            } else {
                println!("{} not found", args.job_id);
            }
            Ok(())
        }
    }
}

/// Shared components every command works with.
struct Runtime {
    settings: Settings,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    objects: Arc<LocalObjectStore>,
    service: JobService,
}

impl Runtime {
    /// PostgreSQL bookkeeping and the Redis queue.
    async fn connect(settings: Settings) -> anyhow::Result<Self> {
        let store = PgJobStore::connect(&settings.database_url)
            .await
            .context("Failed to connect to the database")?;
        let queue = RedisTaskQueue::connect(&settings.redis_url, &settings.queue_name)
            .await
            .context("Failed to connect to the task queue")?;
        Ok(Self::assemble(settings, Arc::new(store), Arc::new(queue)))
    }

    /// Everything in this process; nothing outlives it.
    fn in_memory(settings: Settings) -> Self {
        let queue = MemoryTaskQueue::new(settings.queue_name.clone());
        Self::assemble(settings, Arc::new(MemoryJobStore::new()), Arc::new(queue))
    }

    fn assemble(settings: Settings, store: Arc<dyn JobStore>, queue: Arc<dyn TaskQueue>) -> Self {
        let objects = Arc::new(settings.object_store());
        let dispatcher = Arc::new(Dispatcher::with_config(
            store.clone(),
            queue.clone(),
            settings.dispatcher_config(),
        ));
        let service = JobService::new(
            store.clone(),
            objects.clone(),
            dispatcher,
            settings.max_input_bytes,
        );
        Self {
            settings,
            store,
            queue,
            objects,
            service,
        }
    }

    fn orchestrator(&self) -> anyhow::Result<Arc<PipelineOrchestrator>> {
        let docker = DockerClient::new().context("Failed to set up the Docker client")?;
        let runner = IsolatedRunner::new(Arc::new(docker), self.settings.runner_settings());
        let objects: Arc<dyn ObjectStore> = self.objects.clone();
        let context = StageContext::new(
            Arc::new(runner),
            objects.clone(),
            Arc::new(self.settings.pipeline.clone()),
        );
        Ok(Arc::new(
            PipelineOrchestrator::new(self.store.clone(), StageSet::containers(context))
                .with_objects(objects),
        ))
    }

    fn worker_pool(&self, num_workers: Option<usize>) -> anyhow::Result<WorkerPool> {
        let mut config = self.settings.worker_pool_config();
        if let Some(n) = num_workers {
            anyhow::ensure!(n > 0, "--workers must be at least 1");
            config.num_workers = n;
        }
        Ok(WorkerPool::new(config, self.queue.clone(), self.orchestrator()?))
    }
}

async fn run_migrate_command(settings: &Settings) -> anyhow::Result<()> {
    let store = PgJobStore::connect(&settings.database_url)
        .await
        .context("Failed to connect to the database")?;
    let applied = store.run_migrations().await?;
    info!(applied, "Migrations complete");
    println!("Applied {} migration(s)", applied);
    Ok(())
}

async fn run_worker_command(settings: Settings, args: WorkerArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;
    let runtime = Runtime::connect(settings).await?;
    let mut pool = runtime.worker_pool(args.workers)?;

    pool.start().await?;
    info!(workers = pool.num_workers(), "Workers running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    pool.shutdown().await?;
    let stats = pool.stats();
    info!(
        processed = stats.tasks_processed,
        succeeded = stats.tasks_succeeded,
        failed = stats.tasks_failed,
        retried = stats.tasks_retried,
        cancelled = stats.tasks_cancelled,
        "Worker pool stopped"
    );

    if let Some(path) = args.metrics_file {
        tokio::fs::write(&path, export_metrics())
            .await
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Metrics snapshot written");
    }
    Ok(())
}

/// Creates, uploads and submits a job; returns its id.
async fn create_and_submit(runtime: &Runtime, args: &SubmitArgs) -> anyhow::Result<String> {
    let config = match &args.config {
        Some(raw) => serde_json::from_str(raw).context("--config must be valid JSON")?,
        None => serde_json::Value::Null,
    };
    let (file_name, bytes) = read_input(&args.input).await?;

    let job = runtime
        .service
        .create_job(&args.pipeline, &args.models, config)
        .await?;
    runtime
        .service
        .upload_input(&job.id, &file_name, bytes)
        .await?;
    let handle = runtime.service.submit(&job.id).await?;
    info!(job_id = %job.id, task_handle = %handle, "Job submitted");
    Ok(job.id)
}

async fn run_submit_command(settings: Settings, args: SubmitArgs) -> anyhow::Result<()> {
    let runtime = Runtime::connect(settings).await?;
    let job_id = create_and_submit(&runtime, &args).await?;
    println!("{}", job_id);
    Ok(())
}

async fn run_local_submit_command(settings: Settings, args: SubmitArgs) -> anyhow::Result<()> {
    let runtime = Runtime::in_memory(settings);
    let mut pool = runtime.worker_pool(Some(1))?;
    pool.start().await?;

    let job_id = create_and_submit(&runtime, &args).await?;
    let deadline = runtime.settings.job_timeout + Duration::from_secs(60);
    let finished = tokio::time::timeout(deadline, wait_until_finished(&runtime, &job_id)).await;

    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "Worker pool did not stop cleanly");
    }

    let status = finished.context("Job did not finish in time")??;
    if status == JobStatus::Completed {
        print_json(&runtime.service.results(&job_id, None).await?)
    } else {
        print_json(&runtime.service.status(&job_id).await?)
    }
}

async fn wait_until_finished(runtime: &Runtime, job_id: &str) -> anyhow::Result<JobStatus> {
    loop {
        let job = runtime.service.status(job_id).await?;
        if job.status.is_finished() {
            return Ok(job.status);
        }
        tokio::time::sleep(runtime.settings.poll_interval).await;
    }
}

async fn run_list_command(settings: Settings, args: ListArgs) -> anyhow::Result<()> {
    let mut filter = JobFilter::new();
    if let Some(status) = &args.status {
        filter = filter.with_status(status.parse()?);
    }
    if let Some(pipeline) = args.pipeline {
        filter = filter.with_pipeline(pipeline);
    }

    let runtime = Runtime::connect(settings).await?;
    let jobs = runtime.service.list(&filter, args.limit).await?;
    for job in &jobs {
        println!(
            "{}  {:<16} {:<16} {}",
            job.id,
            job.status.as_str(),
            job.pipeline.name(),
            job.created_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn read_input(path: &Path) -> anyhow::Result<(String, Vec<u8>)> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("Invalid input path {}", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok((file_name, bytes))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
