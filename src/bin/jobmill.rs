//! jobmill CLI: operator interface to the job engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use jobmill::config::Config;
use jobmill::db::Db;
use jobmill::engine::TimeoutReclaimer;
use jobmill::jobtype::load_policies;
use jobmill::model::{JobId, NewJob};
use jobmill::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "jobmill", about = "Job and subtask execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Reclaim subtasks stuck in processing past their job type's threshold
    HandleTimeouts {
        /// Also delete queue items whose job no longer exists
        #[arg(long)]
        cleanup: bool,
        /// Job type policy file (defaults to $JOBMILL_JOB_TYPES)
        #[arg(long)]
        job_types: Option<PathBuf>,
    },
    /// List processing subtasks of one job type with elapsed time
    ShowProcessing {
        job_type: String,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Create a job with its subtasks
    Create {
        job_type: String,
        /// Subtask id (repeatable)
        #[arg(long = "subtask")]
        subtasks: Vec<String>,
        /// Create subtasks "1" through N instead of naming them
        #[arg(long, conflicts_with = "subtasks")]
        count: Option<usize>,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Show a job and its subtasks
    Show { id: i64 },
    /// Pause a job
    Pause { id: i64 },
    /// Resume a paused job
    Resume { id: i64 },
    /// Cancel a job
    Cancel { id: i64 },
    /// Delete a job row (its subtasks become orphans)
    Delete { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "jobmill"))?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    match cli.command {
        Command::Migrate => {
            println!("Migrations applied.");
            Ok(())
        }
        Command::HandleTimeouts { cleanup, job_types } => {
            cmd_handle_timeouts(db, &config, cleanup, job_types).await
        }
        Command::ShowProcessing { job_type } => cmd_show_processing(&db, &job_type).await,
        Command::Job { action } => match action {
            JobAction::Create {
                job_type,
                subtasks,
                count,
                payload,
            } => cmd_job_create(&db, job_type, subtasks, count, payload).await,
            JobAction::Show { id } => cmd_job_show(&db, JobId(id)).await,
            JobAction::Pause { id } => {
                let job = db.pause_job(JobId(id)).await?;
                println!("Job {} is {}", job.id, job.status);
                Ok(())
            }
            JobAction::Resume { id } => {
                let job = db.resume_job(JobId(id)).await?;
                println!("Job {} is {}", job.id, job.status);
                Ok(())
            }
            JobAction::Cancel { id } => {
                let job = db.cancel_job(JobId(id)).await?;
                println!("Job {} is {}", job.id, job.status);
                Ok(())
            }
            JobAction::Delete { id } => {
                if db.delete_job(JobId(id)).await? {
                    println!("Deleted job {id}");
                } else {
                    println!("No job {id}");
                }
                Ok(())
            }
        },
    }
}

async fn cmd_handle_timeouts(
    db: Db,
    config: &Config,
    cleanup: bool,
    job_types: Option<PathBuf>,
) -> anyhow::Result<()> {
    let policies = match job_types {
        Some(path) => load_policies(&path),
        None => config.job_type_policies(),
    }
    .map_err(|e| anyhow::anyhow!("cannot load timeout reclaimer: {e}"))?;

    let reclaimer = TimeoutReclaimer::new(Arc::new(db), &policies);

    let report = reclaimer.handle_timeout_tasks().await?;
    println!("{}", serde_json::to_string(&report)?);

    if cleanup {
        let deleted = reclaimer.cleanup_orphaned_queues().await?;
        println!("Orphaned queue items deleted: {deleted}");
    }
    Ok(())
}

async fn cmd_show_processing(db: &Db, job_type: &str) -> anyhow::Result<()> {
    let items = db.processing_items(job_type).await?;

    if items.is_empty() {
        println!("No processing subtasks for {job_type}.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<8}  {:>10}  LEASE",
        "JOB", "SUBTASK", "ATTEMPT", "ELAPSED_S"
    );
    println!("{}", "-".repeat(72));

    for p in &items {
        let lease = p.item.lease_token.as_deref().unwrap_or("-");
        let lease_display = if lease.len() > 8 { &lease[..8] } else { lease };
        println!(
            "{:<8}  {:<20}  {:<8}  {:>10}  {}",
            p.item.job_id, p.item.subtask_id, p.item.attempts, p.elapsed_secs, lease_display
        );
    }

    println!("\n{} subtask(s)", items.len());
    Ok(())
}

async fn cmd_job_create(
    db: &Db,
    job_type: String,
    subtasks: Vec<String>,
    count: Option<usize>,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewJob::new(&job_type).payload(payload);
    if let Some(n) = count {
        new = new.numbered_subtasks(n);
    }
    for id in subtasks {
        new = new.subtask(id);
    }

    let job = db.create_job(new).await?;
    let counts = db.subtask_counts(&job.job_type, job.id).await?;
    println!(
        "Created job {} ({}) with {} subtask(s)",
        job.id,
        job.job_type,
        counts.total()
    );
    Ok(())
}

async fn cmd_job_show(db: &Db, id: JobId) -> anyhow::Result<()> {
    let job = db.get_job(id).await?;
    let subtasks = db.list_subtasks(&job.job_type, job.id).await?;

    println!("ID:         {}", job.id);
    println!("Type:       {}", job.job_type);
    println!("Status:     {}", job.status);
    println!("Payload:    {}", serde_json::to_string_pretty(&job.payload)?);
    println!(
        "Last Run:   {}",
        job.last_processed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    println!("---");

    for item in &subtasks {
        println!(
            "{:<20}  {:<10}  attempts={:<3}  {}",
            item.subtask_id,
            item.status,
            item.attempts,
            item.error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
