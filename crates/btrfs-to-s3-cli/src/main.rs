mod signal;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use btrfs_to_s3_core::commands::backup::{self, BackupRequest};
use btrfs_to_s3_core::commands::restore::{self, RestoreRequest};
use btrfs_to_s3_core::config::Config;

#[derive(Parser)]
#[command(
    name = "btrfs-to-s3",
    version,
    about = "Crash-consistent Btrfs send-stream backups to S3 cold storage"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot the configured subvolumes and upload chunked send streams
    Backup {
        /// Path to config.toml (absolute)
        #[arg(long)]
        config: PathBuf,

        /// Override global.log_level
        #[arg(long)]
        log_level: Option<String>,

        /// Plan only: no chunking, no uploads
        #[arg(long)]
        dry_run: bool,

        /// Limit the run to specific subvolumes (repeatable)
        #[arg(long = "subvolume")]
        subvolumes: Vec<String>,

        /// Ignore the schedule and run now
        #[arg(long)]
        once: bool,

        /// Run snapshot + stream + chunk locally, suppress uploads
        #[arg(long)]
        no_s3: bool,
    },

    /// Restore a subvolume from its manifest chain
    Restore {
        /// Path to config.toml (absolute)
        #[arg(long)]
        config: PathBuf,

        /// Override global.log_level
        #[arg(long)]
        log_level: Option<String>,

        /// Subvolume short name
        #[arg(long)]
        subvolume: String,

        /// Target path for the restored subvolume (must not exist)
        #[arg(long)]
        target: PathBuf,

        /// Restore from this manifest key instead of the current pointer
        #[arg(long)]
        manifest_key: Option<String>,

        /// Max seconds to wait for archive-tier restoration
        #[arg(long)]
        restore_timeout: Option<u64>,

        /// Wait for archive-tier restoration to complete
        #[arg(long, overrides_with = "no_wait_restore")]
        wait_restore: bool,

        /// Fail immediately on unrestored archive-tier chunks
        #[arg(long, overrides_with = "wait_restore")]
        no_wait_restore: bool,

        /// Override restore.verify_mode
        #[arg(long, value_parser = ["none", "sample", "full"])]
        verify: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let (config_path, log_level) = match &cli.command {
        Commands::Backup {
            config, log_level, ..
        }
        | Commands::Restore {
            config, log_level, ..
        } => (config.clone(), log_level.clone()),
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return e.exit_code();
        }
    };

    let level = log_level.as_deref().unwrap_or(&config.global.log_level);
    let filter = match tracing_filter(level) {
        Some(filter) => filter,
        None => {
            eprintln!("Error: invalid log level: {level}");
            return 2;
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    signal::install_signal_handlers();

    let result = match cli.command {
        Commands::Backup {
            dry_run,
            subvolumes,
            once,
            no_s3,
            ..
        } => {
            let request = BackupRequest {
                dry_run,
                subvolumes,
                once,
                no_s3,
            };
            backup::run(&config, &request, &signal::SHUTDOWN)
        }
        Commands::Restore {
            subvolume,
            target,
            manifest_key,
            restore_timeout,
            wait_restore,
            no_wait_restore,
            verify,
            ..
        } => {
            let request = RestoreRequest {
                subvolume,
                target,
                manifest_key,
                verify,
                wait_restore: match (wait_restore, no_wait_restore) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                restore_timeout,
            };
            restore::run(&config, &request)
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, exit_code = e.exit_code(), "command failed");
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

/// Map the config's syslog-style level names onto tracing filters.
fn tracing_filter(level: &str) -> Option<&'static str> {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warning" => Some("warn"),
        "error" => Some("error"),
        "critical" => Some("error"),
        _ => None,
    }
}
