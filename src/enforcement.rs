use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::EnforcementConfig;
use crate::error::EnforcementError;
use crate::event_log::EndReason;
use crate::platform;

/// What the accountant asks the host to do when time is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination<'a> {
    pub user_id: &'a str,
    pub reason: EndReason,
    /// The user was already over budget when the session started
    pub at_login: bool,
}

/// Capability to end a user's session, supplied by the host environment
pub trait SessionTerminator: Send + Sync {
    fn terminate_session(&self, request: &Termination<'_>) -> Result<(), EnforcementError>;
}

/// Tells the user their time is running out
pub trait CountdownNotifier: Send + Sync {
    fn send_warning(&self, user_id: &str, minutes_remaining: u32);
}

type Mechanism = Box<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Longest wait between two logout attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Logs the user out through the platform mechanism, escalating through a
/// bounded number of attempts
pub struct LogoutEnforcer {
    config: EnforcementConfig,
    mechanism: Mechanism,
}

impl LogoutEnforcer {
    pub fn new(config: EnforcementConfig) -> Self {
        Self::with_mechanism(config, platform::terminate_user)
    }

    pub fn with_mechanism<F>(config: EnforcementConfig, mechanism: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            config,
            mechanism: Box::new(mechanism),
        }
    }

    fn send_notification(&self, title: &str, message: &str) {
        if !self.config.notify {
            return;
        }
        if let Err(e) = platform::notify(title, message) {
            warn!("Failed to show notification: {:#}", e);
        }
    }

    fn grace_period(&self, at_login: bool) -> Duration {
        if at_login {
            // Nothing to save yet; just long enough for the notice to appear
            if self.config.grace_period_seconds == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(100)
            }
        } else {
            Duration::from_secs(self.config.grace_period_seconds)
        }
    }

    /// Exponential backoff after the given failed attempt (1-based)
    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1_u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.retry_delay_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
    }
}

impl CountdownNotifier for LogoutEnforcer {
    fn send_warning(&self, user_id: &str, minutes_remaining: u32) {
        info!("Sending {} minute warning to {}", minutes_remaining, user_id);
        self.send_notification(
            "Computer Time",
            &format!(
                "You have {} minute{} of computer time left today. Please save your work.",
                minutes_remaining,
                if minutes_remaining == 1 { "" } else { "s" }
            ),
        );
    }
}

impl SessionTerminator for LogoutEnforcer {
    fn terminate_session(&self, request: &Termination<'_>) -> Result<(), EnforcementError> {
        let user = request.user_id;
        info!("Enforcing daily limit for {} ({:?})", user, request.reason);

        let message = match request.reason {
            EndReason::StoreUnavailable => {
                "Computer time could not be recorded. You will be logged out."
            }
            _ => "Time is up for today. See you tomorrow!",
        };
        self.send_notification("Computer Time", message);
        std::thread::sleep(self.grace_period(request.at_login));

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match (self.mechanism)(user) {
                Ok(()) => {
                    info!("Session for {} terminated", user);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Failed to terminate session for {} (attempt {}/{}): {:#}",
                        user, attempt, max_attempts, e
                    );
                    last_error = format!("{:#}", e);
                    if attempt < max_attempts {
                        std::thread::sleep(self.retry_delay(attempt));
                    }
                }
            }
        }

        error!(
            "Could not log out {} after {} attempts; administrator attention required",
            user, max_attempts
        );
        Err(EnforcementError::ActionFailed {
            user: user.to_string(),
            attempts: max_attempts,
            reason: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quiet_config() -> EnforcementConfig {
        EnforcementConfig {
            grace_period_seconds: 0,
            max_attempts: 3,
            retry_delay_ms: 1,
            notify: false,
        }
    }

    fn request(user: &str) -> Termination<'_> {
        Termination {
            user_id: user,
            reason: EndReason::LimitReached,
            at_login: false,
        }
    }

    #[test]
    fn test_terminates_on_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let enforcer = LogoutEnforcer::with_mechanism(quiet_config(), move |user| {
            assert_eq!(user, "alice");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        enforcer.terminate_session(&request("alice")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let enforcer = LogoutEnforcer::with_mechanism(quiet_config(), move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("loginctl not available")
            }
            Ok(())
        });

        enforcer.terminate_session(&request("alice")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let enforcer = LogoutEnforcer::with_mechanism(quiet_config(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("no logout mechanism")
        });

        let err = enforcer.terminate_session(&request("alice")).unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let EnforcementError::ActionFailed { attempts, reason, .. } = err;
        assert_eq!(attempts, 3);
        assert!(reason.contains("no logout mechanism"));
    }

    #[test]
    fn test_many_attempts_do_not_overflow_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let enforcer = LogoutEnforcer::with_mechanism(
            EnforcementConfig {
                max_attempts: 70,
                retry_delay_ms: 0,
                ..quiet_config()
            },
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("no logout mechanism")
            },
        );

        let err = enforcer.terminate_session(&request("alice")).unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 70);
        assert!(matches!(err, EnforcementError::ActionFailed { attempts: 70, .. }));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let enforcer = LogoutEnforcer::with_mechanism(
            EnforcementConfig {
                retry_delay_ms: 500,
                ..quiet_config()
            },
            |_| Ok(()),
        );

        assert_eq!(enforcer.retry_delay(1), Duration::from_millis(500));
        assert_eq!(enforcer.retry_delay(3), Duration::from_secs(2));
        assert_eq!(enforcer.retry_delay(25), MAX_RETRY_DELAY);
        assert_eq!(enforcer.retry_delay(u32::MAX), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_login_time_grace_is_short() {
        let enforcer = LogoutEnforcer::with_mechanism(
            EnforcementConfig {
                grace_period_seconds: 30,
                ..quiet_config()
            },
            |_| Ok(()),
        );
        assert_eq!(enforcer.grace_period(false), Duration::from_secs(30));
        assert_eq!(enforcer.grace_period(true), Duration::from_millis(100));

        let immediate = LogoutEnforcer::with_mechanism(quiet_config(), |_| Ok(()));
        assert_eq!(immediate.grace_period(true), Duration::ZERO);
    }
}
