//! Offline queue CLI commands.
//!
//! Manual intervention on the durable queue:
//! - `conductor queue status` - Show counts per status
//! - `conductor queue list` - List entries
//! - `conductor queue requeue <id>` - Give a poisoned entry a fresh budget

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::config;
use crate::domain::JobId;
use crate::offline::{
    AlwaysConnected, JsonlQueueStorage, OfflineQueue, QueuedJob, QueuedJobStatus,
};

/// Queue subcommands
#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Show queue status
    Status,

    /// List queued jobs
    List {
        /// Filter by status (pending, processing, retrying, poisoned)
        #[arg(short, long)]
        status: Option<QueuedJobStatus>,

        /// Maximum number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one queued job as JSON
    Show {
        /// Job ID
        id: String,
    },

    /// Move a poisoned job back to pending with a fresh attempt budget
    Requeue {
        /// Job ID
        id: String,
    },

    /// Remove a queued job
    Remove {
        /// Job ID
        id: String,
    },

    /// Remove every queued job
    Clear {
        /// Confirm removal
        #[arg(long)]
        yes: bool,
    },

    /// Rewrite the queue log without its history
    Compact,
}

/// Execute a queue command against the log at `queue_file`
/// (defaults to the configured path)
pub async fn execute(command: QueueCommands, queue_file: Option<PathBuf>) -> Result<()> {
    let path = match queue_file {
        Some(path) => path,
        None => config::queue_file()?,
    };
    let storage = Arc::new(
        JsonlQueueStorage::open(&path)
            .await
            .with_context(|| format!("Failed to open queue file: {}", path.display()))?,
    );

    let max_attempts = config::config()?.queue.max_attempts;
    let queue = OfflineQueue::new(storage.clone(), Arc::new(AlwaysConnected::default()))
        .with_max_attempts(max_attempts);

    match command {
        QueueCommands::Status => execute_status(&queue, &path).await,
        QueueCommands::List { status, limit } => execute_list(&queue, status, limit).await,
        QueueCommands::Show { id } => execute_show(&queue, &id).await,
        QueueCommands::Requeue { id } => execute_requeue(&queue, &id).await,
        QueueCommands::Remove { id } => execute_remove(&queue, &id).await,
        QueueCommands::Clear { yes } => execute_clear(&queue, yes).await,
        QueueCommands::Compact => {
            let dropped = storage.compact().await?;
            println!("✓ Compacted queue log ({} record(s) dropped)", dropped);
            Ok(())
        }
    }
}

async fn execute_status(queue: &OfflineQueue, path: &std::path::Path) -> Result<()> {
    let summary = queue.summary().await?;

    println!();
    println!("Offline Queue Status");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!("Queue file:    {}", path.display());
    println!("Max attempts:  {}", queue.max_attempts());
    println!();
    println!("Queue:");
    println!("  Pending:    {}", summary.pending);
    println!("  Processing: {}", summary.processing);
    println!("  Retrying:   {}", summary.retrying);
    println!("  Poisoned:   {}", summary.poisoned);
    println!("  Total:      {}", summary.total());
    println!();

    if summary.poisoned > 0 {
        println!("⚠️  {} poisoned job(s) need attention (`conductor queue list --status poisoned`)", summary.poisoned);
    }

    Ok(())
}

async fn execute_list(queue: &OfflineQueue, status: Option<QueuedJobStatus>, limit: usize) -> Result<()> {
    let jobs: Vec<QueuedJob> = queue
        .list()
        .await?
        .into_iter()
        .filter(|job| status.map_or(true, |s| job.status == s))
        .take(limit)
        .collect();

    if jobs.is_empty() {
        println!("No queued jobs");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<11} {:>7}  {}", "JOB ID", "KIND", "STATUS", "ATTEMPT", "LAST ERROR");
    println!("{}", "-".repeat(100));

    for job in jobs {
        println!(
            "{:<38} {:<24} {:<11} {:>7}  {}",
            job.id,
            job.kind(),
            job.status,
            job.attempt,
            job.last_error.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

async fn execute_show(queue: &OfflineQueue, id: &str) -> Result<()> {
    let job = queue
        .get(&JobId::new(id))
        .await?
        .with_context(|| format!("Queued job not found: {}", id))?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn execute_requeue(queue: &OfflineQueue, id: &str) -> Result<()> {
    let job = queue.requeue(&JobId::new(id)).await?;
    println!("✓ Requeued {} ({})", job.id, job.kind());
    Ok(())
}

async fn execute_remove(queue: &OfflineQueue, id: &str) -> Result<()> {
    if queue.remove(&JobId::new(id)).await? {
        println!("✓ Removed {}", id);
    } else {
        anyhow::bail!("Queued job not found: {}", id);
    }
    Ok(())
}

async fn execute_clear(queue: &OfflineQueue, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to clear the queue without --yes");
    }

    let removed = queue.clear().await?;
    println!("✓ Removed {} queued job(s)", removed);
    Ok(())
}
