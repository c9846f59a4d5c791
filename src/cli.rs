use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Daily computer-time quota enforcement
///
/// Tracks how long each user has been logged in today and logs them out once
/// the daily budget is spent.
#[derive(Parser, Debug)]
#[command(name = "computer-safety")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (defaults to the system location)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Track the current session in the foreground until time runs out or
    /// the session ends
    Run {
        /// Account to track (defaults to the current user)
        #[arg(long)]
        user: Option<String>,

        /// Goal category for this session (e.g. Research, Entertainment, Games)
        #[arg(long, requires = "plan")]
        category: Option<String>,

        /// What exactly the session is for
        #[arg(long, requires = "category")]
        plan: Option<String>,
    },
    /// Show remaining time for today
    Status {
        #[arg(long)]
        user: Option<String>,

        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Show daily usage for past days
    History {
        #[arg(long)]
        user: Option<String>,

        /// Number of days to show
        #[arg(long, default_value = "7")]
        days: usize,
    },
    /// Show recent session events
    Log {
        #[arg(long)]
        user: Option<String>,

        /// Number of events to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Write an example configuration file
    Init {
        /// Output path (defaults to the system config location)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    ShowConfig,
}
