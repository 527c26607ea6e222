//! Opt-in retries with exponential backoff.
//!
//! Channels never retry on their own. [`retry_with_policy`] re-issues a call
//! as a brand new call while the failure is retryable (UNAVAILABLE,
//! RESOURCE_EXHAUSTED, ABORTED, or a transport failure) and the policy has
//! attempts left. Delays follow the
//! [gRPC connection backoff](https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md)
//! schedule.
//!
//! ```ignore
//! use wirecall_client::{CallOptions, RetryPolicy, retry_with_policy};
//!
//! let policy = RetryPolicy::new().max_retries(5);
//! let reply = retry_with_policy(&policy, || {
//!     channel.unary_call::<HelloRequest, HelloReply>("/greet.Greeter/SayHello", &request, CallOptions::new())
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::ClientError;

/// gRPC connection backoff constants.
pub mod defaults {
    use std::time::Duration;

    pub const BASE_DELAY: Duration = Duration::from_secs(1);
    pub const MULTIPLIER: f64 = 1.6;
    /// Delays vary by +/- this fraction.
    pub const JITTER: f64 = 0.2;
    pub const MAX_DELAY: Duration = Duration::from_secs(120);
    pub const MAX_RETRIES: u32 = 3;
}

/// How often and how patiently to retry.
///
/// `max_retries` counts retries, not the first attempt.
///
/// ```
/// use std::time::Duration;
/// use wirecall_client::RetryPolicy;
///
/// let policy = RetryPolicy::new()
///     .max_retries(5)
///     .base_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(2));
/// assert!(policy.validate().is_ok());
/// assert!(RetryPolicy::new().jitter(1.5).validate().is_err());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: defaults::BASE_DELAY,
            multiplier: defaults::MULTIPLIER,
            jitter: defaults::JITTER,
            max_delay: defaults::MAX_DELAY,
            max_retries: defaults::MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_retry() -> Self {
        Self::default().max_retries(0)
    }

    /// Short delays for latency sensitive calls: 50ms up to 1s, 5 retries.
    pub fn aggressive() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            max_retries: 5,
            ..Self::default()
        }
    }

    /// Long delays for background work: 2s up to 5min, 10 retries.
    pub fn patient() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            max_retries: 10,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor between delays; must be at least 1.0.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Random spread of each delay; must be within `0.0..=1.0`.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.base_delay > self.max_delay {
            return Err(ClientError::invalid_argument("base_delay must not exceed max_delay"));
        }
        if !(self.multiplier >= 1.0) {
            return Err(ClientError::invalid_argument("multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ClientError::invalid_argument("jitter must be between 0.0 and 1.0"));
        }
        Ok(())
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.clone())
    }
}

/// Delays between attempts under a [`RetryPolicy`].
///
/// As an iterator it yields one delay per allowed retry, then `None`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    // Un-jittered delay in seconds; kept as f64 so repeated growth does not round.
    current: f64,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let current = policy.base_delay.as_secs_f64();
        Self {
            policy,
            current,
            attempts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.policy.base_delay.as_secs_f64();
        self.attempts = 0;
    }

    /// Retries handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.policy.max_retries
    }

    /// Next delay, jittered and capped at `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let max = self.policy.max_delay.as_secs_f64();
        let jitter = self.policy.jitter;
        let delay = if jitter > 0.0 {
            self.current * (1.0 + rand::random_range(-jitter..=jitter))
        } else {
            self.current
        };

        self.current = (self.current * self.policy.multiplier).min(max);
        self.attempts += 1;
        Duration::from_secs_f64(delay.clamp(0.0, max))
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.can_retry().then(|| self.next_delay())
    }
}

/// [`retry_with_policy`] with [`RetryPolicy::default`].
pub async fn retry<F, Fut, T>(call: F) -> Result<T, ClientError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    retry_with_policy(&RetryPolicy::default(), call).await
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of retries. The last error is returned.
///
/// An invalid policy fails with INVALID_ARGUMENT before the first attempt.
pub async fn retry_with_policy<F, Fut, T>(policy: &RetryPolicy, call: F) -> Result<T, ClientError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    policy.validate()?;
    let mut backoff = policy.backoff();
    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() {
            return Err(err);
        }
        let Some(delay) = backoff.next() else {
            return Err(err);
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(
            error = %err,
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "retrying call"
        );
        tokio::time::sleep(delay).await;
    }
}
