//! Retry combinator for conflict-prone read-modify-write cycles.
//!
//! The optimistic strategy never blocks; contention shows up as version
//! conflicts instead. [`retry_on_conflict`] re-runs the whole cycle according
//! to a [`RetryPolicy`] and makes exhaustion observable as
//! [`DecreaseError::OptimisticConflict`].

#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use stocklock_types::{DecreaseError, ResourceId};
use tracing::{debug, warn};

/// Delay between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// Delay doubles with every retry, starting at `base`, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound for any single delay.
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let doublings = attempt.saturating_sub(1).min(31);
                base.checked_mul(1 << doublings)
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

/// How many retries a policy allows after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// Give up after this many retries.
    Bounded(u32),
    /// Retry until the cycle succeeds.
    Unbounded,
}

/// Context passed to a [`MetricsHook`] before each retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    /// Retry number, starting at 1 for the first retry.
    pub attempt: u32,
    /// Delay that will be slept before this retry.
    pub delay: Duration,
    /// Resource whose write conflicted.
    pub resource_id: ResourceId,
}

/// Observer notified before every retry.
pub trait MetricsHook: Send + Sync {
    /// Called once per retry, before the backoff delay.
    fn on_retry_attempt(&self, ctx: &RetryContext);
}

/// Configuration of the optimistic retry loop.
///
/// ```ignore
/// let policy = RetryPolicy::new()
///     .max_retries(20)
///     .backoff(Backoff::Fixed(Duration::from_millis(10)))
///     .with_metrics_hook(hook);
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    limit: RetryLimit,
    backoff: Backoff,
    jitter: bool,
    metrics_hook: Option<Arc<dyn MetricsHook>>,
}

impl RetryPolicy {
    /// Default policy: 100 retries, fixed 50 ms backoff, ±20% jitter.
    pub fn new() -> Self {
        Self {
            limit: RetryLimit::Bounded(100),
            backoff: Backoff::Fixed(Duration::from_millis(50)),
            jitter: true,
            metrics_hook: None,
        }
    }

    /// Retry until success with a fixed 50 ms delay and no jitter.
    ///
    /// Under sustained contention this can livelock; prefer a bounded policy.
    pub fn unbounded() -> Self {
        Self {
            limit: RetryLimit::Unbounded,
            jitter: false,
            ..Self::new()
        }
    }

    /// Give up after `retries` retries.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.limit = RetryLimit::Bounded(retries);
        self
    }

    /// Use the given delay schedule.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable ±20% jitter on every delay.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Notify `hook` before every retry.
    pub fn with_metrics_hook<H: MetricsHook + 'static>(mut self, hook: H) -> Self {
        self.metrics_hook = Some(Arc::new(hook));
        self
    }

    pub fn limit(&self) -> RetryLimit {
        self.limit
    }

    /// True when another retry is allowed after `retries` retries so far.
    pub fn allows_retry(&self, retries: u32) -> bool {
        match self.limit {
            RetryLimit::Bounded(max) => retries < max,
            RetryLimit::Unbounded => true,
        }
    }

    /// Delay before retry number `attempt`, jittered when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay_for(attempt);
        if self.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("limit", &self.limit)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("metrics_hook", &self.metrics_hook.is_some())
            .finish()
    }
}

/// Add random jitter to prevent thundering herd effect
fn add_jitter(delay: Duration) -> Duration {
    let jitter_factor = rand::rng().random_range(0.8..1.2);
    delay.mul_f64(jitter_factor)
}

/// Run `operation` until it stops reporting a version conflict.
///
/// Only [`DecreaseError::OptimisticConflict`] is retried; every other error is
/// returned immediately. Once the policy is exhausted the conflict is returned
/// with the total number of attempts made.
pub async fn retry_on_conflict<F, Fut>(
    policy: &RetryPolicy,
    resource_id: ResourceId,
    mut operation: F,
) -> Result<(), DecreaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), DecreaseError>>,
{
    let mut retries: u32 = 0;

    loop {
        match operation().await {
            Ok(()) => {
                if retries > 0 {
                    debug!(
                        resource_id = %resource_id,
                        retries,
                        "[retry.succeeded] write succeeded after retries"
                    );
                }
                return Ok(());
            }
            Err(DecreaseError::OptimisticConflict { .. }) => {
                if !policy.allows_retry(retries) {
                    let attempts = retries.saturating_add(1);
                    warn!(
                        resource_id = %resource_id,
                        attempts,
                        "[retry.exhausted] giving up after repeated version conflicts"
                    );
                    return Err(DecreaseError::OptimisticConflict {
                        resource_id,
                        attempts,
                    });
                }

                retries = retries.saturating_add(1);
                let delay = policy.delay_for(retries);

                if let Some(hook) = &policy.metrics_hook {
                    hook.on_retry_attempt(&RetryContext {
                        attempt: retries,
                        delay,
                        resource_id,
                    });
                }

                debug!(
                    resource_id = %resource_id,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    "[retry.conflict] version conflict, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}
