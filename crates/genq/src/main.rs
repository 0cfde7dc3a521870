//! `genq` operator CLI.
//!
//! The external scheduler runs `genq tick` on an interval; everything else
//! is enqueue, status and admin. Every command prints JSON on stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use genq::config::{load_config_or_default, Config};
use genq::content::{ArtifactSettings, FileContentStore};
use genq::db::job_repo::JobFilter;
use genq::logging::{self, LogFormat};
use genq::queue::{BulkPayload, JobAction, Queue, SubmitOptions};
use genq::Database;

#[derive(Parser)]
#[command(name = "genq")]
#[command(about = "Durable job queue for topic-driven content generation")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.genq/config.json when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log format, overriding the config
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scheduled tick (no-op while paused or while another tick runs)
    Tick,
    /// Run one tick even while paused
    ForceTick,
    /// Recover jobs stuck in processing
    Sweep,
    /// Enqueue one job
    Submit(SubmitArgs),
    /// Enqueue one job per topic under a new batch
    SubmitBulk(SubmitBulkArgs),
    /// Show batch progress
    Status {
        batch: String,
    },
    /// Show queue statistics
    Stats,
    /// Show one job
    Job {
        id: String,
    },
    /// List jobs, newest first
    Jobs(JobsArgs),
    /// Stop scheduled ticks
    Pause,
    /// Resume scheduled ticks
    Resume,
    /// Put failed jobs back to pending
    RetryFailed {
        #[arg(long)]
        batch: Option<String>,
    },
    /// Delete completed jobs
    ClearCompleted,
    /// Cancel the pending jobs of a batch
    Cancel {
        batch: String,
    },
    /// Cancel one pending job
    CancelJob {
        id: String,
    },
}

#[derive(Args)]
struct SubmitArgs {
    /// Topic; repeat for bulk_expand
    #[arg(long = "topic", required = true)]
    topics: Vec<String>,

    /// generate_content, generate_image, refresh_content or bulk_expand
    #[arg(long, default_value = "generate_content")]
    action: JobAction,

    #[arg(long, default_value_t = 0)]
    priority: i64,

    /// Seconds before the job becomes eligible
    #[arg(long, default_value_t = 0)]
    delay_secs: u64,

    #[arg(long)]
    provider: Option<String>,

    /// Prompt template with {topic} placeholders
    #[arg(long)]
    template: Option<String>,

    /// Artifact being refreshed (refresh_content)
    #[arg(long)]
    artifact_id: Option<String>,

    #[arg(long)]
    publish_status: Option<String>,
}

#[derive(Args)]
struct SubmitBulkArgs {
    #[arg(long = "topic", required = true)]
    topics: Vec<String>,

    #[arg(long)]
    template: Option<String>,

    #[arg(long)]
    provider: Option<String>,

    #[arg(long, default_value_t = 0)]
    priority: i64,

    #[arg(long)]
    publish_status: Option<String>,
}

#[derive(Args)]
struct JobsArgs {
    #[arg(long)]
    status: Option<String>,

    #[arg(long)]
    batch: Option<String>,

    #[arg(long)]
    action: Option<String>,

    #[arg(long)]
    provider: Option<String>,

    #[arg(long, default_value_t = 50)]
    limit: u64,

    #[arg(long, default_value_t = 0)]
    offset: u64,
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("genq: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let format = cli.log_format.unwrap_or(config.logging.format);
    if let Err(e) = logging::init(format, &config.logging.filter) {
        eprintln!("genq: {}", e);
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("genq: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_queue(config: &Config, database: Option<PathBuf>) -> CliResult<Queue> {
    let db_path = database
        .or_else(|| config.database_path())
        .ok_or("cannot determine the database path; set database_path")?;
    let output = config
        .output_directory()
        .ok_or("cannot determine the output directory; set content.output_directory")?;

    let db = Database::open(&db_path)?;
    let store = Arc::new(FileContentStore::new(output));
    let registry = config.build_registry();
    if !registry.has_any_configured() {
        log::warn!("No generation provider has usable credentials; submissions will be rejected");
    }
    Ok(Queue::builder(db, registry, store)
        .dispatcher_config(config.dispatcher_config())
        .executor_config(config.executor_config())
        .build())
}

fn print<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn settings(publish_status: Option<String>) -> ArtifactSettings {
    ArtifactSettings {
        publish_status,
        ..Default::default()
    }
}

async fn run(cli: Cli, config: Config) -> CliResult<()> {
    let queue = build_queue(&config, cli.database)?;

    match cli.command {
        Commands::Tick => print(&queue.tick().await?),
        Commands::ForceTick => print(&queue.force_tick().await?),
        Commands::Sweep => match queue.sweep_stuck()? {
            Some(summary) => print(&summary),
            None => print(&json!({ "skipped": "lease_held" })),
        },
        Commands::Submit(args) => {
            let payload = submit_payload(&args)?;
            let options = SubmitOptions {
                priority: args.priority,
                delay: Duration::from_secs(args.delay_secs),
            };
            let id = queue.submit(args.action, payload, options)?;
            print(&json!({ "jobId": id }))
        }
        Commands::SubmitBulk(args) => {
            let mut bulk = BulkPayload::new(args.topics);
            bulk.template = args.template;
            bulk.provider = args.provider;
            bulk.settings = settings(args.publish_status);
            let batch_id = queue.submit_bulk(bulk, args.priority)?;
            print(&queue.get_batch_status(&batch_id)?)
        }
        Commands::Status { batch } => print(&queue.get_batch_status(&batch)?),
        Commands::Stats => print(&queue.get_queue_stats()?),
        Commands::Job { id } => print(&queue.get_job(&id)?),
        Commands::Jobs(args) => {
            let filter = JobFilter {
                status: args.status,
                action: args.action,
                batch_id: args.batch,
                provider_used: args.provider,
                limit: Some(args.limit),
                offset: Some(args.offset),
            };
            let (jobs, total) = queue.list_jobs(&filter)?;
            print(&json!({ "total": total, "jobs": jobs }))
        }
        Commands::Pause => {
            queue.pause()?;
            print(&json!({ "isPaused": true }))
        }
        Commands::Resume => {
            queue.resume()?;
            print(&json!({ "isPaused": false }))
        }
        Commands::RetryFailed { batch } => {
            let reset = queue.retry_failed(batch.as_deref())?;
            print(&json!({ "reset": reset }))
        }
        Commands::ClearCompleted => {
            let deleted = queue.clear_completed()?;
            print(&json!({ "deleted": deleted }))
        }
        Commands::Cancel { batch } => {
            let cancelled = queue.cancel_batch(&batch)?;
            print(&json!({ "cancelled": cancelled }))
        }
        Commands::CancelJob { id } => {
            queue.cancel_job(&id)?;
            print(&json!({ "cancelled": id }))
        }
    }
}

fn submit_payload(args: &SubmitArgs) -> CliResult<serde_json::Value> {
    let settings = settings(args.publish_status.clone());
    let mut payload = if args.action == JobAction::BulkExpand {
        json!({ "topics": args.topics, "settings": settings })
    } else {
        let [topic] = args.topics.as_slice() else {
            return Err(format!("{} takes exactly one --topic", args.action).into());
        };
        json!({ "topic": topic, "settings": settings })
    };

    if let Some(object) = payload.as_object_mut() {
        if let Some(template) = &args.template {
            object.insert("template".to_string(), json!(template));
        }
        if let Some(provider) = &args.provider {
            object.insert("provider".to_string(), json!(provider));
        }
        if let Some(artifact_id) = &args.artifact_id {
            object.insert("artifact_id".to_string(), json!(artifact_id));
        }
    }
    Ok(payload)
}
