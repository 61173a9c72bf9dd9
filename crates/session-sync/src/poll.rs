//! Cancellable waits and bounded backoff polls.

use crate::error::Cancelled;
use market_config::PollConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sleep for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Drive `future` to completion unless `cancel` fires first.
pub async fn run_or_cancel<F: Future>(
    future: F,
    cancel: &CancellationToken,
) -> Result<F::Output, Cancelled> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        output = future => Ok(output),
    }
}

/// Attempt budget for one poll.
///
/// Each [`wait`](Backoff::wait) sleeps the next backoff delay, clipped so the
/// total never exceeds the ceiling, and reports whether another attempt may
/// be made.
#[derive(Debug)]
pub struct Backoff {
    config: PollConfig,
    attempts: u32,
    deadline: Instant,
}

impl Backoff {
    /// Start a poll. The first attempt is counted by the first `wait`.
    pub fn new(config: &PollConfig) -> Self {
        Self {
            config: config.clone(),
            attempts: 0,
            deadline: Instant::now() + config.ceiling(),
        }
    }

    /// Number of waits performed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    fn next_delay(&self) -> Option<Duration> {
        if self.attempts + 1 >= self.config.max_attempts.max(1) {
            return None;
        }
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        Some(self.config.delay_for_attempt(self.attempts).min(remaining))
    }

    /// Wait before the next attempt. Returns `Ok(false)` when the poll is
    /// exhausted and the caller should stop.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<bool, Cancelled> {
        let Some(delay) = self.next_delay() else {
            return Ok(false);
        };
        sleep_or_cancel(delay, cancel).await?;
        self.attempts += 1;
        Ok(true)
    }
}
