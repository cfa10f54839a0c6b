//! Per-step retry with exponential backoff and a hard attempt timeout

use crate::config::{Defaults, NodeDefinition};
use crate::error::StepError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Retry settings for one step
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    pub backoff_factor: f64,

    /// Hard deadline for a single attempt
    pub timeout: Duration,

    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_defaults(&Defaults::default())
    }
}

impl RetryPolicy {
    /// Create a policy from the engine-wide defaults
    pub fn from_defaults(defaults: &Defaults) -> Self {
        Self {
            max_attempts: defaults.max_attempts.max(1),
            base_delay: Duration::from_millis(defaults.base_delay_ms),
            max_delay: Duration::from_millis(defaults.max_delay_ms),
            backoff_factor: defaults.backoff_factor,
            timeout: Duration::from_millis(defaults.timeout_ms),
            jitter: defaults.jitter,
        }
    }

    /// Defaults with a node's `retry` and `timeout` overrides applied
    pub fn for_node(defaults: &Defaults, node: &NodeDefinition) -> Self {
        let mut policy = Self::from_defaults(defaults);
        if let Some(ref retry) = node.retry {
            if let Some(max_attempts) = retry.max_attempts {
                policy.max_attempts = max_attempts.max(1);
            }
            if let Some(factor) = retry.backoff_factor {
                policy.backoff_factor = factor;
            }
            if let Some(max_delay) = retry.max_delay {
                policy.max_delay = Duration::from_millis(max_delay);
            }
            if let Some(base_delay) = retry.base_delay {
                policy.base_delay = Duration::from_millis(base_delay);
            }
        }
        if let Some(timeout) = node.timeout {
            policy.timeout = Duration::from_millis(timeout);
        }
        policy
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            // Add up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25 * capped_delay;
            capped_delay + jitter
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay.max(0.0))
    }
}

/// Lifecycle of one attempt, reported to an [`AttemptObserver`]
#[derive(Debug)]
pub enum AttemptEvent<'a, T> {
    Started {
        attempt: u32,
    },
    Finished {
        attempt: u32,
        elapsed: Duration,
        result: &'a Result<T, StepError>,
        /// Another attempt follows this one
        will_retry: bool,
    },
}

/// Receives attempt events while [`run_with_policy`] is looping
pub trait AttemptObserver<T> {
    fn on_attempt(&mut self, event: AttemptEvent<'_, T>);
}

/// Observer that ignores every event
pub struct NoopObserver;

impl<T> AttemptObserver<T> for NoopObserver {
    fn on_attempt(&mut self, _event: AttemptEvent<'_, T>) {}
}

/// Run an operation under a retry policy
///
/// The operation receives the 1-based attempt number. Each attempt is cut off
/// after `policy.timeout`. Errors that are not retryable end the loop at once;
/// the returned error carries the attempt it failed on.
pub async fn run_with_policy<T, F, Fut, O>(
    policy: &RetryPolicy,
    mut operation: F,
    observer: &mut O,
) -> Result<T, StepError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
    O: AttemptObserver<T> + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        observer.on_attempt(AttemptEvent::Started { attempt });
        let started = Instant::now();

        let result = match tokio::time::timeout(policy.timeout, operation(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(StepError::timeout(policy.timeout)),
        }
        .map_err(|e| e.with_attempt(attempt, max_attempts));

        let will_retry = match result {
            Ok(_) => false,
            Err(ref e) => e.is_retryable() && attempt < max_attempts,
        };

        observer.on_attempt(AttemptEvent::Finished {
            attempt,
            elapsed: started.elapsed(),
            result: &result,
            will_retry,
        });

        if !will_retry {
            return result;
        }

        let delay = policy.delay_for_attempt(attempt);
        tracing::debug!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, "Retrying after backoff");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
