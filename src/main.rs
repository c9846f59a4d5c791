use anyhow::{Context, Result};
use clap::Parser;

mod accountant;
mod cli;
mod clock;
mod commands;
mod config;
mod enforcement;
mod error;
mod event_log;
mod fs_util;
mod platform;
mod store;
mod tracker;

use cli::{Args, Commands};
use event_log::SessionGoal;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config_path = args.config.as_deref();
    let load = || config::load_effective(config_path).context("Failed to load configuration");

    match args.command {
        Commands::Run { user, category, plan } => {
            let goal = match (category, plan) {
                (Some(category), Some(plan)) => Some(SessionGoal { category, plan }),
                _ => None,
            };
            commands::run(&load()?, user, goal)
        }
        Commands::Status { user, json } => commands::status(&load()?, user, json),
        Commands::History { user, days } => commands::history(&load()?, user, days),
        Commands::Log { user, limit } => commands::log(&load()?, user, limit),
        Commands::Init { output, force } => commands::init(output, force),
        Commands::ShowConfig => commands::show_config(&load()?),
    }
}

/// Initialize logging
fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { "info" };

    // stdout is reserved for command output
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}
