//! Retry manager: linear/exponential backoff bounded by a deadline.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Jitter mode applied to each computed backoff delay (following AWS SDK
/// patterns).
#[derive(Clone, Debug, Default)]
pub enum JitterMode {
    /// No jitter - use the exact computed delay.
    None,
    /// Full jitter: random delay between 0 and the computed backoff.
    #[default]
    Full,
    /// Equal jitter: half fixed + half random.
    Equal,
    /// Decorrelated jitter (AWS-recommended): `base + random(0, delay*3 -
    /// base)`.
    Decorrelated,
}

fn apply_jitter(delay: Duration, mode: &JitterMode) -> Duration {
    let mut rng = rand::thread_rng();
    match mode {
        JitterMode::None => delay,
        JitterMode::Full => Duration::from_secs_f64(rng.gen::<f64>() * delay.as_secs_f64()),
        JitterMode::Equal => {
            let half = delay.as_secs_f64() / 2.0;
            Duration::from_secs_f64(half + rng.gen::<f64>() * half)
        }
        JitterMode::Decorrelated => {
            let base = delay.as_secs_f64() / 3.0;
            let upper = delay.as_secs_f64() * 3.0;
            Duration::from_secs_f64(base + rng.gen::<f64>() * (upper - base))
        }
    }
}

/// How successive backoff delays are computed from `base_interval`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffMode {
    /// Every attempt waits `base_interval`.
    Linear,
    /// Attempt `n` waits `base_interval * 2^n`, capped at the remaining
    /// time until the deadline.
    Exponential,
}

/// A cooperative cancellation flag. `RetryManager::invoke` and the writer's
/// in-flight `send`/`initialize_destination` calls check this between
/// attempts so that `stop()` can interrupt a pending retry loop within one
/// round-trip rather than waiting out a full backoff sleep first.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sleep for up to `duration`, waking early (and returning `false`) if
/// `token` is cancelled. Never panics or propagates interruption as an
/// error - "quiet" in that sense.
pub fn sleep_quietly(duration: Duration, token: &CancellationToken) -> bool {
    const SLICE: Duration = Duration::from_millis(25);
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(SLICE));
    }
}

/// Outcome of a retry loop that did not return a value through
/// `operation`.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The deadline elapsed before `operation` returned a value, and this
    /// manager was built with `raise_on_timeout(true)`.
    Timeout,
    /// `operation` returned an error and no `on_exception` handler
    /// absorbed it (or the handler chose to propagate it).
    Operation(E),
    /// `sleep_quietly` observed cancellation mid-wait.
    Cancelled,
}

/// Executes an operation repeatedly until it returns `Ok(Some(_))`, the
/// deadline elapses, or an unhandled error propagates.
pub struct RetryManager {
    base_interval: Duration,
    mode: BackoffMode,
    jitter: JitterMode,
    raise_on_timeout: bool,
}

impl RetryManager {
    pub fn new(base_interval: Duration, mode: BackoffMode) -> Self {
        Self {
            base_interval,
            mode,
            jitter: JitterMode::Full,
            raise_on_timeout: false,
        }
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    /// When set, a deadline timeout is surfaced as `RetryError::Timeout`
    /// instead of `Ok(None)`.
    pub fn raise_on_timeout(mut self, raise: bool) -> Self {
        self.raise_on_timeout = raise;
        self
    }

    fn backoff_for(&self, attempt: u32, remaining: Duration) -> Duration {
        let base = match self.mode {
            BackoffMode::Linear => self.base_interval,
            BackoffMode::Exponential => {
                let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
                self.base_interval
                    .checked_mul(factor as u32)
                    .unwrap_or(remaining)
            }
        };
        apply_jitter(base.min(remaining), &self.jitter)
    }

    /// Run `operation` until it yields `Ok(Some(value))`, `deadline`
    /// elapses, or an unhandled error occurs.
    ///
    /// `operation` returns `Ok(None)` to mean "no result yet, retry
    /// according to backoff"; `on_exception`, when given, observes errors
    /// from `operation` and decides whether the loop should keep retrying
    /// (`true`) or stop and propagate (`false`).
    pub fn invoke<T, E>(
        &self,
        deadline: Instant,
        token: &CancellationToken,
        mut operation: impl FnMut() -> Result<Option<T>, E>,
        mut on_exception: Option<impl FnMut(&E) -> bool>,
    ) -> Result<Option<T>, RetryError<E>> {
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            if Instant::now() >= deadline {
                break;
            }

            match operation() {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => {
                    let retry = on_exception.as_mut().map(|cb| cb(&e)).unwrap_or(false);
                    if !retry {
                        return Err(RetryError::Operation(e));
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let delay = self.backoff_for(attempt, remaining);
            if !sleep_quietly(delay, token) {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;
        }

        if self.raise_on_timeout {
            Err(RetryError::Timeout)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_first_success() {
        let manager = RetryManager::new(Duration::from_millis(1), BackoffMode::Linear);
        let token = CancellationToken::new();
        let mut calls = 0;
        let result: Result<Option<i32>, RetryError<()>> = manager.invoke(
            Instant::now() + Duration::from_secs(1),
            &token,
            || {
                calls += 1;
                Ok(Some(42))
            },
            None::<fn(&()) -> bool>,
        );
        assert!(matches!(result, Ok(Some(42))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retries_until_deadline_then_returns_none() {
        let manager = RetryManager::new(Duration::from_millis(5), BackoffMode::Linear);
        let token = CancellationToken::new();
        let result: Result<Option<i32>, RetryError<()>> = manager.invoke(
            Instant::now() + Duration::from_millis(30),
            &token,
            || Ok(None),
            None::<fn(&()) -> bool>,
        );
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn raise_on_timeout_surfaces_timeout_error() {
        let manager =
            RetryManager::new(Duration::from_millis(5), BackoffMode::Linear).raise_on_timeout(true);
        let token = CancellationToken::new();
        let result: Result<Option<i32>, RetryError<()>> = manager.invoke(
            Instant::now() + Duration::from_millis(20),
            &token,
            || Ok(None),
            None::<fn(&()) -> bool>,
        );
        assert!(matches!(result, Err(RetryError::Timeout)));
    }

    #[test]
    fn unhandled_exception_propagates() {
        let manager = RetryManager::new(Duration::from_millis(1), BackoffMode::Linear);
        let token = CancellationToken::new();
        let result: Result<Option<i32>, RetryError<&str>> = manager.invoke(
            Instant::now() + Duration::from_secs(1),
            &token,
            || Err("boom"),
            None::<fn(&&str) -> bool>,
        );
        assert!(matches!(result, Err(RetryError::Operation("boom"))));
    }

    #[test]
    fn on_exception_can_absorb_and_retry() {
        let manager = RetryManager::new(Duration::from_millis(1), BackoffMode::Linear);
        let token = CancellationToken::new();
        let mut attempts = 0;
        let result: Result<Option<i32>, RetryError<&str>> = manager.invoke(
            Instant::now() + Duration::from_secs(1),
            &token,
            || {
                attempts += 1;
                if attempts < 3 {
                    Err("transient")
                } else {
                    Ok(Some(7))
                }
            },
            Some(|_: &&str| true),
        );
        assert!(matches!(result, Ok(Some(7))));
        assert_eq!(attempts, 3);
    }
}
