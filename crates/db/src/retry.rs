//! Bounded retry with exponential backoff.
//!
//! Each call to [`BackoffExecutor::run`] drives its own [`BackoffState`]; the
//! executor itself holds only the policy, so one instance is shared by every
//! caller. Sleeping between attempts suspends the calling task only.

use std::future::Future;
use std::time::Duration;

use bizdesk_core::config::RetryConfig;
use bizdesk_core::errors::{DataError, ErrorClass, RemoteError};
use bizdesk_core::query::WriteOp;
use tracing::{error, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first try; total tries is `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay slept before retry number `retry` (1-based): `base`, `2*base`,
    /// `4*base`, ... capped at `max_delay`. Retry 0 is the first try.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry - 1).min(16);
        self.base_delay.saturating_mul(1_u32 << exponent).min(self.max_delay)
    }

    /// Upper bound on time spent sleeping across all retries.
    pub fn max_total_delay(&self) -> Duration {
        (1..=self.max_retries).map(|retry| self.delay_for(retry)).sum()
    }
}

/// Outcome of a single try, as seen by the state machine.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Success(T),
    Retryable(E),
    Permanent(E),
}

impl<T, E> Attempt<T, E> {
    pub fn classify(result: Result<T, E>, classify: impl Fn(&E) -> ErrorClass) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => match classify(&error) {
                ErrorClass::Transient => Self::Retryable(error),
                ErrorClass::Permanent => Self::Permanent(error),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackoffState {
    attempt: u32,
    next_delay: Duration,
}

impl BackoffState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    fn begin_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Schedules the next try after a retryable failure, or `None` when the
    /// attempt budget is spent.
    fn schedule_retry(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if self.attempt >= policy.max_attempts() {
            return None;
        }
        self.next_delay = policy.delay_for(self.attempt);
        Some(self.next_delay)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryFailure<E> {
    Permanent { error: E, attempts: u32 },
    Exhausted { last: E, attempts: u32 },
}

impl<E> RetryFailure<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> &E {
        match self {
            Self::Permanent { error, .. } => error,
            Self::Exhausted { last, .. } => last,
        }
    }
}

impl From<RetryFailure<RemoteError>> for DataError {
    fn from(value: RetryFailure<RemoteError>) -> Self {
        match value {
            RetryFailure::Permanent { error, .. } => Self::Permanent(error),
            RetryFailure::Exhausted { last, attempts } => Self::RetryExhausted { attempts, last },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BackoffExecutor {
    policy: RetryPolicy,
}

impl BackoffExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<T, E, F, Fut, C>(
        &self,
        mut operation: F,
        classify: C,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: std::fmt::Display,
    {
        let mut state = BackoffState::default();

        loop {
            state.begin_attempt();
            match Attempt::classify(operation().await, &classify) {
                Attempt::Success(value) => return Ok(value),
                Attempt::Permanent(error) => {
                    return Err(RetryFailure::Permanent { error, attempts: state.attempt() });
                }
                Attempt::Retryable(last) => {
                    let Some(delay) = state.schedule_retry(&self.policy) else {
                        error!(
                            event_name = "db.retry.exhausted",
                            attempts = state.attempt(),
                            error = %last,
                            "remote call failed after all attempts"
                        );
                        return Err(RetryFailure::Exhausted { last, attempts: state.attempt() });
                    };

                    warn!(
                        event_name = "db.retry.scheduled",
                        attempt = state.attempt(),
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %last,
                        "transient remote failure; retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// [`Self::run`] specialised to remote store calls.
    pub async fn run_remote<T, F, Fut>(&self, operation: F) -> Result<T, RetryFailure<RemoteError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.run(operation, RemoteError::class).await
    }

    /// [`Self::run`] for a remote write, classed by [`WriteOp::retry_class`].
    pub async fn run_write<T, F, Fut>(
        &self,
        op: &WriteOp,
        operation: F,
    ) -> Result<T, RetryFailure<RemoteError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.run(operation, |error| op.retry_class(error)).await
    }
}
