//! Platform-specific session termination and notifications

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub mod linux;

use anyhow::{Context, Result};

/// Log the given user out using the platform mechanism
pub fn terminate_user(user: &str) -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        windows::terminate_user(user)
    }

    #[cfg(target_os = "macos")]
    {
        macos::terminate_user(user)
    }

    #[cfg(target_os = "linux")]
    {
        linux::terminate_user(user)
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        let _ = user;
        anyhow::bail!("Unsupported operating system for session termination")
    }
}

/// Show a desktop notification to the logged-in user
pub fn notify(title: &str, message: &str) -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        windows::notify(title, message)
    }

    #[cfg(target_os = "macos")]
    {
        macos::notify(title, message)
    }

    #[cfg(target_os = "linux")]
    {
        linux::notify(title, message)
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        tracing::warn!("Notification: {} - {}", title, message);
        Ok(())
    }
}

/// Name of the account this process runs as
pub fn current_username() -> Result<String> {
    for var in ["USER", "USERNAME", "LOGNAME"] {
        if let Ok(name) = std::env::var(var) {
            if !name.is_empty() {
                return Ok(name);
            }
        }
    }

    #[cfg(unix)]
    {
        passwd_name(unsafe { libc::getuid() })
            .context("Failed to resolve current user from the passwd database")
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("Failed to determine current user: USERNAME is not set")
    }
}

/// Look up a login name by uid
#[cfg(unix)]
fn passwd_name(uid: libc::uid_t) -> Option<String> {
    // SAFETY: getpwuid returns a pointer into static storage or null; the name
    // is copied out before any other passwd call can overwrite it.
    unsafe {
        let pw = libc::getpwuid(uid);
        if pw.is_null() || (*pw).pw_name.is_null() {
            return None;
        }
        std::ffi::CStr::from_ptr((*pw).pw_name)
            .to_str()
            .ok()
            .map(str::to_string)
    }
}

/// Look up a uid by login name
#[cfg(all(unix, any(test, target_os = "macos")))]
pub fn uid_for(user: &str) -> Option<u32> {
    let name = std::ffi::CString::new(user).ok()?;
    // SAFETY: `name` outlives the call; the result is read immediately.
    unsafe {
        let pw = libc::getpwnam(name.as_ptr());
        if pw.is_null() {
            None
        } else {
            Some((*pw).pw_uid)
        }
    }
}

/// Run a command, returning Ok only when it exits successfully
pub(crate) fn try_command(cmd: &str, args: &[&str]) -> Result<()> {
    let output = std::process::Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", cmd))?;

    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!(
            "Command failed: {} {:?} ({}): {}",
            cmd,
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }
}
