//! Decision model: what to do with a message whose handler failed.
//!
//! The Decision type (what to do next) and the Decider trait (how to pick it
//! from the attempt state and the error). Deciders are pure: executing the
//! decision (re-enqueue, nack, store the failure) is the worker's job.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::errors::ActorError;
use super::retry::RetryPolicy;

/// Actor-supplied retry predicate, called with the number of retries already
/// performed and the error. When present it replaces the count/age checks.
#[derive(Clone)]
pub struct RetryWhen(Arc<dyn Fn(u32, &ActorError) -> bool + Send + Sync>);

impl RetryWhen {
    pub fn new(predicate: impl Fn(u32, &ActorError) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn should_retry(&self, retries: u32, error: &ActorError) -> bool {
        (self.0)(retries, error)
    }
}

impl fmt::Debug for RetryWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryWhen(..)")
    }
}

/// The next action for a failed message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Re-enqueue a copy after `delay`.
    Retry { delay: Duration, reason: String },

    /// Give up: nack to the dead-letter queue.
    DeadLetter { reason: String },
}

/// Everything the decider needs to know about a failed attempt.
///
/// Limits are already resolved (message option, then actor option, then the
/// broker default); `None` means "not configured" and never blocks a retry.
#[derive(Debug, Clone)]
pub struct AttemptState {
    /// Retries already performed before this attempt.
    pub retries: u32,
    pub age: Duration,
    pub max_retries: Option<u32>,
    pub max_age: Option<Duration>,
    pub backoff: RetryPolicy,
    pub retry_when: Option<RetryWhen>,
}

pub trait Decider: Send + Sync {
    fn decide(&self, attempt: &AttemptState, error: &ActorError) -> Decision;
}

/// Default decider:
/// - `retry_when` present: retry iff it says so
/// - otherwise retry iff `retries < max_retries` and `age < max_age`
/// - delay from `RetryPolicy`, optionally jittered
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    jitter: bool,
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self { jitter: true }
    }
}

impl DefaultDecider {
    /// A decider with deterministic delays.
    pub fn without_jitter() -> Self {
        Self { jitter: false }
    }

    fn should_retry(&self, attempt: &AttemptState, error: &ActorError) -> Result<(), String> {
        if let Some(predicate) = &attempt.retry_when {
            return if predicate.should_retry(attempt.retries, error) {
                Ok(())
            } else {
                Err(format!("retry_when declined retry after {} retries", attempt.retries))
            };
        }
        if let Some(max_retries) = attempt.max_retries {
            if attempt.retries >= max_retries {
                return Err(format!("retries exhausted ({}/{max_retries})", attempt.retries));
            }
        }
        if let Some(max_age) = attempt.max_age {
            if attempt.age >= max_age {
                return Err(format!(
                    "message age {}ms exceeds max_age {}ms",
                    attempt.age.as_millis(),
                    max_age.as_millis()
                ));
            }
        }
        Ok(())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, attempt: &AttemptState, error: &ActorError) -> Decision {
        match self.should_retry(attempt, error) {
            Err(reason) => Decision::DeadLetter { reason },
            Ok(()) => {
                let attempts = attempt.retries + 1;
                let delay = if self.jitter {
                    attempt.backoff.next_delay_with_jitter(attempts)
                } else {
                    attempt.backoff.next_delay(attempts)
                };
                Decision::Retry {
                    delay,
                    reason: format!("retry {} after {}ms", attempts, delay.as_millis()),
                }
            }
        }
    }
}
