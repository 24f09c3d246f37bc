//! convsync CLI
//!
//! Maintenance tools for convsync stores.
//!
//! # Commands
//!
//! - `inspect` - Display record counts, sync state and metadata
//! - `verify` - Check log framing and store invariants
//! - `compact` - Rewrite the log as a single snapshot
//! - `dump-log` - Dump log records for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// convsync command-line store tools.
#[derive(Parser)]
#[command(name = "convsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display record counts, sync state and metadata
    Inspect {
        /// List conflict and rejection markers
        #[arg(short, long)]
        markers: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check log framing and store invariants
    Verify {
        /// Only scan the log; do not open the store
        #[arg(short, long)]
        log_only: bool,
    },

    /// Rewrite the log as a single snapshot
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Dump log records for debugging
    DumpLog {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { markers, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, markers, &format)?;
        }
        Commands::Verify { log_only } => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path, log_only)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::DumpLog {
            limit,
            offset,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump-log")?;
            commands::dump_log::run(&path, limit, offset, &format)?;
        }
        Commands::Version => {
            println!("convsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("convsync core v{}", convsync_core::VERSION);
        }
    }

    Ok(())
}
