//! Resilience utilities: retry with backoff, bounded polling.
//!
//! - [`RetryConfig`]: exponential backoff schedule
//! - [`retry_transient`]: retry an operation while its error is retryable
//! - [`Poller`] / [`poll_until`]: wait for a condition with a hard deadline
//!
//! Nothing here loops forever. Every wait has an upper bound and reports
//! [`AgentError::Timeout`] when it runs out, so a stuck peer surfaces as a
//! visible status instead of a hung tick.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> pg_replication_agent::error::Result<()> {
//! use pg_replication_agent::resilience::{poll_until, RetryConfig};
//! use std::time::Duration;
//!
//! let schedule = RetryConfig::polling(Duration::from_secs(1));
//! poll_until("promotion", &schedule, Duration::from_secs(300), || async {
//!     Ok(true) // e.g. !db.is_in_recovery().await?
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AgentError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Schedule for polling loops: starts at `interval`, backs off gently,
    /// never waits more than ten intervals between checks. Attempts are
    /// bounded by the poll deadline, not by count.
    pub fn polling(interval: Duration) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: interval,
            max_delay: interval.saturating_mul(10),
            backoff_factor: 1.5,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::try_from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
            .unwrap_or(self.max_delay);

        std::cmp::min(delay, self.max_delay)
    }
}

/// Run `op`, retrying while it fails with a retryable error.
pub async fn retry_transient<F, Fut, T>(operation: &str, config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                debug!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Paces a polling loop and enforces its deadline.
///
/// ```text
/// loop {
///     if done().await? { break; }
///     poller.wait().await?;   // sleeps, or Err(Timeout) past the deadline
/// }
/// ```
#[derive(Debug)]
pub struct Poller {
    operation: String,
    schedule: RetryConfig,
    started: Instant,
    deadline: Instant,
    attempt: usize,
}

impl Poller {
    pub fn new(operation: impl Into<String>, schedule: RetryConfig, timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            operation: operation.into(),
            schedule,
            started,
            deadline: started + timeout,
            attempt: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// Sleep until the next check, or fail if the deadline has passed.
    pub async fn wait(&mut self) -> Result<()> {
        let now = Instant::now();
        if now >= self.deadline {
            warn!(
                operation = %self.operation,
                attempts = self.attempt,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Poll deadline exceeded"
            );
            return Err(AgentError::Timeout {
                operation: self.operation.clone(),
                elapsed: self.elapsed(),
            });
        }
        self.attempt += 1;
        let delay = self
            .schedule
            .delay_for_attempt(self.attempt)
            .min(self.deadline - now);
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Poll `check` until it returns true, failing with a timeout after `timeout`.
pub async fn poll_until<F, Fut>(
    operation: &str,
    schedule: &RetryConfig,
    timeout: Duration,
    mut check: F,
) -> Result<Duration>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut poller = Poller::new(operation, schedule.clone(), timeout);
    loop {
        if check().await? {
            return Ok(poller.elapsed());
        }
        poller.wait().await?;
    }
}
