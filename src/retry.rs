//! Bounded exponential backoff with a pluggable clock.
//!
//! Every blocking point in a join (credential wait, registry compare-and-swap,
//! resource replace, gateway labelling) is expressed as a [`RetryConfig`]
//! driven through [`poll_with_backoff`]. The [`Clock`] seam lets tests observe
//! the requested delays without sleeping.
//!
//! # Example
//!
//! ```ignore
//! use fabric::retry::{poll_with_backoff, RetryConfig, TokioClock};
//!
//! let token = poll_with_backoff(
//!     &RetryConfig::credential_wait(),
//!     &TokioClock,
//!     "cluster-a token",
//!     || async { secrets.token_secret(ns, "cluster-a").await.map(|s| s.and_then(token_of)) },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{error, warn};

use crate::{Error, Result};

/// Configuration for a bounded retry loop.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, always at least one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter factor: each delay is scaled by a random value in `1.0..=1.0 + jitter`
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Compare-and-swap loop over the globalnet registry record
    pub fn registry_update() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: 0.1,
        }
    }

    /// Waiting for the platform to populate a service account token
    pub fn credential_wait() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.2,
            jitter: 1.0,
        }
    }

    /// Delete-and-recreate of a conflicting external resource
    pub fn resource_replace() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 1.5,
            jitter: 0.0,
        }
    }

    /// Labelling a gateway node, retried on write conflicts
    pub fn node_label() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.2,
            jitter: 0.0,
        }
    }

    /// Same policy without delays, for tests and dry runs
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

/// Iterator-like delay schedule derived from a [`RetryConfig`].
///
/// Yields one delay per retry, i.e. `max_attempts - 1` delays in total.
#[derive(Debug)]
pub struct Backoff {
    remaining: u32,
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    /// Start a schedule for `config`
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            remaining: config.max_attempts.max(1) - 1,
            delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Delay to wait before the next attempt, or `None` when attempts are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let mut current = self.delay;
        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0..=1.0 + self.jitter);
            current = Duration::from_secs_f64(current.as_secs_f64() * factor);
        }

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
        );
        Some(current.min(self.max_delay))
    }
}

/// Source of delays for retry loops
#[async_trait]
pub trait Clock: Send + Sync {
    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that returns immediately and records every requested sleep
#[derive(Debug, Default)]
pub struct ManualClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Create a clock with no recorded sleeps
    pub fn new() -> Self {
        Self::default()
    }

    /// All sleeps requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Total simulated time
    pub fn elapsed(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
    }
}

/// Poll `check` until it yields a value, sleeping between attempts.
///
/// `Ok(None)` means "not ready yet" and is retried; `Err` aborts immediately.
/// When the attempts are used up the result is [`Error::Unavailable`] naming
/// `what`.
pub async fn poll_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    clock: &dyn Clock,
    what: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(value) = check().await? {
            return Ok(value);
        }

        match backoff.next_delay() {
            Some(delay) => {
                warn!(
                    resource = %what,
                    attempt = attempt,
                    delay_ms = delay.as_millis(),
                    "Not ready yet, waiting"
                );
                clock.sleep(delay).await;
            }
            None => {
                error!(resource = %what, attempt = attempt, "Gave up waiting");
                return Err(Error::unavailable(
                    what,
                    format!("not ready after {} attempts", attempt),
                ));
            }
        }
    }
}

/// Execute an async operation, retrying errors accepted by `should_retry`.
///
/// Errors rejected by `should_retry` and the error of the final attempt are
/// returned as-is.
pub async fn retry_with_backoff<F, Fut, T, P>(
    config: &RetryConfig,
    clock: &dyn Clock,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Operation failed, retrying"
                    );
                    clock.sleep(delay).await;
                }
                None => {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }
            },
        }
    }
}
