use anyhow::Result;
use tracing::{debug, warn};

use super::try_command;

/// End every session of `user`
///
/// systemd-logind first; if that is unavailable, kill the user's processes,
/// which makes the display manager drop the session.
pub fn terminate_user(user: &str) -> Result<()> {
    match try_command("loginctl", &["terminate-user", user]) {
        Ok(()) => return Ok(()),
        Err(e) => warn!("loginctl terminate-user failed: {:#}", e),
    }

    try_command("pkill", &["-KILL", "-u", user])
}

/// Desktop notification through notify-send
pub fn notify(title: &str, message: &str) -> Result<()> {
    debug!("notify-send: {}", title);
    try_command(
        "notify-send",
        &[title, message, "--urgency=critical", "--icon=dialog-warning"],
    )
}
