//! Command-line interface for conductor.
//!
//! Provides commands for inspecting and repairing the durable offline queue
//! and for showing the resolved configuration.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config;

pub mod queue;

/// conductor - Event-driven job orchestration
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Offline queue file (overrides configuration)
    #[arg(long, global = true, env = "CONDUCTOR_QUEUE_FILE")]
    pub queue_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and repair the offline queue
    Queue {
        #[command(subcommand)]
        command: queue::QueueCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Queue { command } => queue::execute(command, self.queue_file).await,
            Commands::Config => show_config(),
        }
    }
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Conductor Configuration");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Queue file:  {}", cfg.queue_file.display());
    println!();
    println!("Default retry policy:");
    println!("  Max retries: {}", cfg.retry.max_retries);
    println!("  Base delay:  {}ms", cfg.retry.base_delay_ms);
    println!("  Multiplier:  {}", cfg.retry.backoff_multiplier);
    match cfg.retry.max_delay_ms {
        Some(max) => println!("  Max delay:   {}ms", max),
        None => println!("  Max delay:   (uncapped)"),
    }
    println!("  On timeout:  {}", if cfg.retry.retry_on_timeout { "retry" } else { "terminal" });
    println!();
    println!("Cache:");
    match cfg.cache.max_entries {
        0 => println!("  Max entries: (unlimited)"),
        n => println!("  Max entries: {}", n),
    }
    match cfg.cache.default_ttl_ms {
        Some(ttl) => println!("  Default TTL: {}ms", ttl),
        None => println!("  Default TTL: (none)"),
    }
    println!("  Sweep every: {}ms", cfg.cache.sweep_interval_ms);
    println!();
    println!("Offline queue:");
    println!("  Max attempts: {}", cfg.queue.max_attempts);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::QueuedJobStatus;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_queue_list() {
        let cli = Cli::try_parse_from([
            "conductor",
            "--queue-file",
            "/tmp/q.jsonl",
            "queue",
            "list",
            "--status",
            "poisoned",
        ])
        .unwrap();

        assert_eq!(cli.queue_file, Some(PathBuf::from("/tmp/q.jsonl")));
        match cli.command {
            Commands::Queue {
                command: queue::QueueCommands::List { status, limit },
            } => {
                assert_eq!(status, Some(QueuedJobStatus::Poisoned));
                assert_eq!(limit, 20);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let result = Cli::try_parse_from(["conductor", "queue", "list", "--status", "done"]);
        assert!(result.is_err());
    }
}
