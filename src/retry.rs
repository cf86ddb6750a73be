//! Deadline-bounded retry with a fixed interval.
//!
//! Unlike a generic backoff, the loop here is bounded by wall-clock time
//! measured from the first attempt, and only errors the caller classifies as
//! transient are retried. Anything else is returned immediately.
//!
//! # Example
//!
//! ```ignore
//! use upf_operator::retry::{retry_until_deadline, RetryConfig};
//!
//! let output = retry_until_deadline(
//!     &RetryConfig::new(Duration::from_secs(2), Duration::from_secs(300)),
//!     "run bootstrap command",
//!     |e| e.is_command_failure(),
//!     || async { gateway.exec(&cmd, &env, timeout).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, warn};

use crate::{Error, Result};

/// Interval and budget of a bounded retry loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Fixed delay between attempts
    pub interval: Duration,
    /// Total budget measured from the first attempt
    pub budget: Duration,
}

impl RetryConfig {
    /// Create a config with the given interval and budget
    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self { interval, budget }
    }
}

/// Execute an async operation until it succeeds or the budget is spent.
///
/// Errors for which `is_transient` returns false are propagated unchanged.
/// Once a transient failure happens at or after the deadline, the loop gives
/// up with [`Error::TimeoutExceeded`].
pub async fn retry_until_deadline<F, Fut, T, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_transient(&e) => return Err(e),
            Err(e) => {
                let elapsed = started.elapsed();
                if elapsed >= config.budget {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        elapsed_secs = elapsed.as_secs(),
                        "Operation did not succeed within budget"
                    );
                    return Err(Error::timeout(operation_name, config.budget));
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = config.interval.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(config.interval).await;
            }
        }
    }
}
