use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::accountant::{Collaborators, SessionAccountant};
use crate::clock::{Clock, SystemClock};
use crate::config::{BypassSwitch, QuotaConfig, EXAMPLE_CONFIG, get_config_path};
use crate::enforcement::LogoutEnforcer;
use crate::event_log::{JsonlEventLog, SessionGoal};
use crate::platform;
use crate::store::{FileUsageStore, UsageStore, WriteBehindStore, validate_user_id};
use crate::tracker::{SessionTracker, shutdown_signal};

/// Resolve `--user`, defaulting to the account we run as
fn resolve_user(user: Option<String>) -> Result<String> {
    let user = match user {
        Some(user) => user,
        None => platform::current_username()?,
    };
    validate_user_id(&user).with_context(|| format!("Cannot track user {:?}", user))?;
    Ok(user)
}

fn usage_store(config: &QuotaConfig) -> Result<FileUsageStore> {
    Ok(FileUsageStore::new(config.resolve_data_dir()?.join("state")))
}

fn event_log(config: &QuotaConfig) -> Result<JsonlEventLog> {
    Ok(JsonlEventLog::new(config.resolve_data_dir()?.join("logs")))
}

/// Track the session in the foreground
pub fn run(
    config: &QuotaConfig,
    user: Option<String>,
    goal: Option<SessionGoal>,
) -> Result<()> {
    let bypass = BypassSwitch::from_env();
    let user = resolve_user(user)?;
    let data_dir = config.resolve_data_dir()?;

    info!("computer-safety v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", data_dir.display());
    info!(
        "Daily limit: {}s, tick every {}s",
        config.daily_limit_seconds, config.tick_interval_seconds
    );

    let file_store: Arc<dyn UsageStore> = Arc::new(usage_store(config)?);
    let store = Arc::new(
        WriteBehindStore::new(file_store, config.save_timeout())
            .context("Failed to start usage writer")?,
    );
    let enforcer = Arc::new(LogoutEnforcer::new(config.enforcement.clone()));

    let deps = Collaborators {
        clock: Arc::new(SystemClock),
        store: store.clone(),
        events: Arc::new(event_log(config)?),
        terminator: enforcer.clone(),
    };
    let accountant = SessionAccountant::new(user, config, bypass, deps);
    let tracker = SessionTracker::new(
        accountant,
        enforcer,
        config.tick_interval(),
        config.warnings_minutes.clone(),
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(tracker.run(goal, shutdown_signal()));

    // Whatever happened, the last tick must be on disk before we exit
    let flushed = store.flush();
    let summary = outcome.context("Enforcement failed")?;
    flushed.context("Failed to persist final usage")?;

    info!(
        "Session for {} finished ({}): {}s this session since {}, {}s today, {}s left",
        summary.user_id,
        summary
            .reason
            .map(|r| format!("{:?}", r))
            .unwrap_or_else(|| summary.state.as_str().to_string()),
        summary.session_seconds,
        summary
            .started_at
            .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string()),
        summary.seconds_used_today,
        summary.remaining_seconds
    );

    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    user_id: String,
    day: chrono::NaiveDate,
    seconds_used: u64,
    daily_limit_seconds: u64,
    remaining_seconds: u64,
    enforced: bool,
}

/// Remaining time for today, read from the persisted store
pub fn status(config: &QuotaConfig, user: Option<String>, json: bool) -> Result<()> {
    let user = resolve_user(user)?;
    let today = SystemClock.local_day(SystemClock.now());
    let record = usage_store(config)?
        .load(&user, today)
        .context("Failed to read usage record")?;

    let report = StatusReport {
        user_id: user,
        day: today,
        seconds_used: record.seconds_used,
        daily_limit_seconds: config.daily_limit_seconds,
        remaining_seconds: config.daily_limit_seconds.saturating_sub(record.seconds_used),
        enforced: !BypassSwitch::from_env().is_enabled(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Computer Time - {} ({})", report.user_id, report.day);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Used today:      {}", format_clock(report.seconds_used));
    println!("Daily limit:     {}", format_clock(report.daily_limit_seconds));
    println!("Time remaining:  {}", format_clock(report.remaining_seconds));
    if !report.enforced {
        println!();
        println!("Enforcement is disabled (bypass is set)");
    } else if report.remaining_seconds == 0 {
        println!();
        println!("Time is up for today. See you tomorrow!");
    }

    Ok(())
}

/// Per-day usage, most recent first
pub fn history(config: &QuotaConfig, user: Option<String>, days: usize) -> Result<()> {
    let user = resolve_user(user)?;
    let records = usage_store(config)?
        .history(&user, days)
        .context("Failed to read usage history")?;

    if records.is_empty() {
        println!("No usage recorded for {}", user);
        return Ok(());
    }

    println!("Usage history for {}", user);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for record in records {
        let marker = if record.seconds_used >= config.daily_limit_seconds {
            "  (limit reached)"
        } else {
            ""
        };
        println!("{}  {}{}", record.day, format_clock(record.seconds_used), marker);
    }

    Ok(())
}

/// Recent session events
pub fn log(config: &QuotaConfig, user: Option<String>, limit: usize) -> Result<()> {
    let user = resolve_user(user)?;
    let events = event_log(config)?.recent(&user, limit)?;

    if events.is_empty() {
        println!("No sessions recorded for {}", user);
        return Ok(());
    }

    for event in events {
        let mut line = format!(
            "{}  {:<9}  today {}",
            event.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", event.kind).to_lowercase(),
            format_clock(event.seconds_used_today)
        );
        if let Some(secs) = event.session_seconds {
            line.push_str(&format!("  session {}", format_clock(secs)));
        }
        if let Some(reason) = event.reason {
            line.push_str(&format!("  ({:?})", reason));
        }
        if let Some(goal) = event.goal {
            line.push_str(&format!("  [{}] {}", goal.category, goal.plan));
        }
        println!("{}", line);
    }

    Ok(())
}

/// Write the example configuration file
pub fn init(output: Option<PathBuf>, force: bool) -> Result<()> {
    let output_path = output.unwrap_or_else(get_config_path);

    if output_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            output_path.display()
        );
    }

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    std::fs::write(&output_path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", output_path.display()))?;

    println!("✓ Created configuration file: {}", output_path.display());
    println!("\nEdit this file to change the daily limit and tick interval.");
    println!("Then start tracking at login: computer-safety run");

    Ok(())
}

/// Print the configuration after environment overrides
pub fn show_config(config: &QuotaConfig) -> Result<()> {
    println!("{}", serde_yaml::to_string(config).context("Failed to serialize config")?.trim_end());
    println!("# data directory: {}", config.resolve_data_dir()?.display());
    println!("# max credit per tick: {}s", config.max_tick_credit_seconds());
    if BypassSwitch::from_env().is_enabled() {
        println!("# enforcement: DISABLED (bypass set)");
    }
    Ok(())
}

/// Seconds as MM:SS, or H:MM:SS past an hour
fn format_clock(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
