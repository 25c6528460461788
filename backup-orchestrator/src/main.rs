//! backupctl - Main entry point
//!
//! Exit codes: 0 success, 1 partial success or warnings, 2 fatal or
//! validation error.

use anyhow::{anyhow, Result};
use backup_orchestrator::{
    config::Config,
    daemon::ShutdownCoordinator,
    models::ComponentType,
    orchestrator::StatusReport,
    report, utils, BackupOrchestrator, RecoveryOrchestrator,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "backupctl", author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, list, prune and verify backup sets
    Backup {
        #[command(subcommand)]
        action: BackupCommand,
    },

    /// Restore a backup set
    Recover {
        /// Backup set to restore from
        set_id: String,

        /// Comma-separated components (default: every component in the set)
        #[arg(long, value_delimiter = ',')]
        components: Option<Vec<String>>,
    },

    /// Show the run lock holder and the latest backup and recovery
    Status,
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Run a backup of every configured component
    Run,

    /// List backup sets, newest first
    List,

    /// Apply the retention policy
    Prune {
        /// Report what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-check a set's artifacts and refine its status
    Verify {
        set_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Initialize logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "backupctl v{} (backup root: {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.backup_root.display()
    );

    let shutdown = ShutdownCoordinator::new();
    let cancel = shutdown.token();
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    match cli.command {
        Commands::Backup { action } => {
            let orchestrator = BackupOrchestrator::from_config(&config)?;
            match action {
                BackupCommand::Run => {
                    let set = orchestrator.run_backup(&cancel).await?;
                    println!("{}", report::backup_summary(&set));
                    Ok(set.exit_code())
                }
                BackupCommand::List => {
                    let sets = orchestrator.list()?;
                    println!("{}", report::set_list(&sets));
                    Ok(0)
                }
                BackupCommand::Prune { dry_run } => {
                    let pruned = orchestrator.prune(dry_run)?;
                    println!("{}", report::prune_summary(&pruned));
                    Ok(pruned.exit_code())
                }
                BackupCommand::Verify { set_id } => {
                    let verified = orchestrator.verify(&set_id).await?;
                    println!("{}", report::verify_summary(&verified));
                    Ok(verified.exit_code())
                }
            }
        }
        Commands::Recover { set_id, components } => {
            let components = components
                .map(|names| {
                    names
                        .iter()
                        .map(|n| n.trim().parse::<ComponentType>())
                        .collect::<std::result::Result<Vec<_>, String>>()
                })
                .transpose()
                .map_err(|e| anyhow!("invalid --components: {}", e))?;
            let orchestrator = RecoveryOrchestrator::from_config(&config)?;
            let job = orchestrator.restore(&set_id, components, &cancel).await?;
            println!("{}", report::recovery_summary(&job));
            Ok(job.exit_code())
        }
        Commands::Status => {
            let status = StatusReport::collect(&config)?;
            println!("{}", report::status_summary(&status));
            Ok(0)
        }
    }
}
