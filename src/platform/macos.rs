use anyhow::Result;
use tracing::warn;

use super::try_command;

/// End the GUI session of `user`
pub fn terminate_user(user: &str) -> Result<()> {
    if let Some(uid) = super::uid_for(user) {
        match try_command("launchctl", &["bootout", &format!("user/{}", uid)]) {
            Ok(()) => return Ok(()),
            Err(e) => warn!("launchctl bootout failed: {:#}", e),
        }
    }

    try_command(
        "osascript",
        &["-e", "tell application \"System Events\" to log out"],
    )
}

/// Notification through osascript
pub fn notify(title: &str, message: &str) -> Result<()> {
    let script = format!(
        "display notification \"{}\" with title \"{}\" sound name \"Glass\"",
        message.replace('"', "'"),
        title.replace('"', "'")
    );
    try_command("osascript", &["-e", &script])
}
