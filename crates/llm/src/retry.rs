//! Backoff, jitter and cancellable sleeping shared by every call site that
//! waits: model retries, paced line delivery, proactive dispatch.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use confidant_config::LlmConfig;

use crate::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries.max(1),
            initial_backoff: Duration::from_millis(cfg.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.retry_max_backoff_ms),
        }
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for LlmError {
    fn is_transient(&self) -> bool {
        LlmError::is_transient(self)
    }
}

/// Untyped failures (parse errors on model output, for example) are worth
/// another attempt unless they wrap a permanent [`LlmError`].
impl Retryable for anyhow::Error {
    fn is_transient(&self) -> bool {
        self.downcast_ref::<LlmError>()
            .map(LlmError::is_transient)
            .unwrap_or(true)
    }
}

/// `initial * 2^attempt`, capped at `max`.  `attempt` is zero-based.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(20));
    initial.saturating_mul(factor).min(max)
}

/// Uniformly pick a delay in `[d/2, d]`.
pub fn with_jitter(d: Duration) -> Duration {
    let millis = d.as_millis() as u64;
    if millis < 2 {
        return d;
    }
    let half = millis / 2;
    let picked = rand::thread_rng().gen_range(half..=millis);
    Duration::from_millis(picked)
}

/// Sleep for `d` unless `token` fires first.  Returns `false` when the
/// sleep was cut short by cancellation.
pub async fn sleep_cancellable(token: &CancellationToken, d: Duration) -> bool {
    if token.is_cancelled() {
        return false;
    }
    if d.is_zero() {
        return true;
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is
/// spent.  Transient failures sleep a jittered exponential backoff in
/// between; the last error is returned on exhaustion or cancellation.
pub async fn retry_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() || attempt + 1 >= attempts {
            return Err(err);
        }

        let backoff =
            with_jitter(backoff_delay(attempt, policy.initial_backoff, policy.max_backoff));
        warn!(
            label,
            retry = attempt + 1,
            max = attempts,
            backoff_ms = backoff.as_millis() as u64,
            %err,
            "transient failure, backing off"
        );
        if !sleep_cancellable(token, backoff).await {
            warn!(label, "retry aborted by shutdown");
            return Err(err);
        }
        attempt += 1;
    }
}
