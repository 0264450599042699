//! Retry helpers used by the feed (pool resubmission) and the Docker driver
//! (container readiness polling).

use std::time::Duration;

use anyhow::Result;
use tracing::debug;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Same delay every time.
    Fixed(Duration),
    /// Delay doubles each attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    pub fn first(&self) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, .. } => *initial,
        }
    }

    pub fn next(&self, current: Duration) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { max, .. } => std::cmp::min(current * 2, *max),
        }
    }
}

/// Retry `attempt` until it succeeds or `deadline` elapses, sleeping
/// `poll_interval` between attempts. The last error is folded into the
/// timeout message.
pub async fn retry_until_deadline<T, F, Fut>(
    deadline: Duration,
    poll_interval: Duration,
    description: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let cutoff = tokio::time::Instant::now() + deadline;
    let mut last_err = None;

    loop {
        match attempt().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                debug!(error = %e, description, "attempt failed, retrying");
                last_err = Some(e);
            }
        }
        if tokio::time::Instant::now() + poll_interval >= cutoff {
            anyhow::bail!(
                "timed out {} after {:?}: {}",
                description,
                deadline,
                last_err.map(|e| e.to_string()).unwrap_or_default()
            );
        }
        tokio::time::sleep(poll_interval).await;
    }
}
