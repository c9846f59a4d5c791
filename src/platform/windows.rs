use anyhow::Result;
use tracing::warn;

use super::try_command;

/// Log off the interactive session
///
/// The engine runs inside the tracked user's session, so logging off the
/// current session ends that user's session.
pub fn terminate_user(user: &str) -> Result<()> {
    tracing::info!("Logging off {}", user);
    try_command("shutdown", &["/l", "/f"])
}

/// Best-effort message box via msg.exe
pub fn notify(title: &str, message: &str) -> Result<()> {
    if let Err(e) = try_command("msg", &["*", &format!("{}: {}", title, message)]) {
        warn!("Notification: {} - {} ({:#})", title, message, e);
    }
    Ok(())
}
