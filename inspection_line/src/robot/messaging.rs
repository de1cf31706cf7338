use super::server::RobotServer;
use super::session::RobotSession;
use crate::config::RobotMessagingConfig;
use crate::error::{LineError, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Timing of resilient robot request/reply exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait for the expected reply per send
    pub reply_timeout: Duration,
    /// Resends of the same message within one cycle
    pub max_retries: u32,
    pub session_wait: Duration,
    pub session_poll: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Full send/expect cycles before giving up
    pub max_attempts: u32,
}

impl From<&RobotMessagingConfig> for RetryPolicy {
    fn from(config: &RobotMessagingConfig) -> Self {
        Self {
            reply_timeout: Duration::from_millis(config.reply_timeout_ms),
            max_retries: config.max_retries,
            session_wait: Duration::from_millis(config.session_wait_ms),
            session_poll: Duration::from_millis(config.session_poll_ms),
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RobotMessagingConfig::default())
    }
}

/// Send `message` and wait for a reply equal to `expected` (ASCII case-insensitive).
///
/// On a reply timeout the same message is resent, up to `max_retries` times.
/// Returns the number of resends that were needed.
pub async fn send_and_expect(
    session: &RobotSession,
    message: &str,
    expected: &str,
    timeout: Duration,
    max_retries: u32,
    cancel: &CancellationToken,
) -> Result<u32> {
    let robot = session.index();
    session.send_line(message, cancel)?;

    let mut retries = 0;
    loop {
        let reply = session
            .wait_for_message(|line| line.eq_ignore_ascii_case(expected), timeout, cancel)
            .await;
        match reply {
            Ok(_) => {
                info!(robot, "'{}' received", expected);
                return Ok(retries);
            }
            Err(LineError::Timeout(_)) if retries < max_retries => {
                retries += 1;
                warn!(robot, "'{}' timed out, resending '{}' ({}/{})", expected, message, retries, max_retries);
                session.send_line(message, cancel)?;
            }
            Err(LineError::Timeout(_)) => {
                error!(robot, "'{}' not received after {} retries", expected, max_retries);
                return Err(LineError::timeout(format!("robot {} reply '{}'", robot, expected)));
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`send_and_expect`] that survives robot reconnects.
///
/// Each attempt waits for a live session, then runs one full send/expect
/// cycle. Any failure other than cancellation backs off (doubling, capped)
/// and retries until `max_attempts` is reached.
pub async fn resilient_send_and_expect(
    server: &RobotServer,
    robot: u8,
    message: &str,
    expected: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<u32> {
    let mut backoff = policy.backoff_initial;
    let mut attempt = 1;
    loop {
        let outcome = match server
            .wait_for_session(robot, policy.session_wait, policy.session_poll, cancel)
            .await?
        {
            Some(session) => {
                send_and_expect(&session, message, expected, policy.reply_timeout, policy.max_retries, cancel).await
            }
            None => Err(LineError::connection(format!("robot {}", robot), "no session")),
        };

        let e = match outcome {
            Ok(retries) => return Ok(retries),
            Err(e) if e.is_cancelled() => {
                info!(robot, "'{}' exchange cancelled", message);
                return Err(e);
            }
            Err(e) => e,
        };

        if attempt >= policy.max_attempts {
            error!(robot, "'{}' failed after {} attempts: {}", message, attempt, e);
            return Err(e);
        }
        warn!(robot, "attempt {}/{} failed: {}; retrying in {:?}", attempt, policy.max_attempts, e, backoff);

        tokio::select! {
            _ = cancel.cancelled() => return Err(LineError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(policy.backoff_max);
        attempt += 1;
    }
}
