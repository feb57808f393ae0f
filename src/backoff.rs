//! Retry with backoff.
//!
//! Two policies are provided: a constant interval with a bounded attempt
//! count, and an exponential policy bounded by a maximum interval and a
//! maximum elapsed time. Operations classify their failures as transient or
//! permanent; permanent failures short-circuit the retry loop.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Tuning for [`ExponentialBackoff`]. Loaded from the environment as part of
/// the main [`crate::Config`].
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(15 * 60),
        }
    }
}

/// Failure classification returned by retried operations.
#[derive(Debug)]
pub enum BackoffError<E> {
    /// Worth retrying after the next interval.
    Transient(E),
    /// Retrying cannot help; surface immediately.
    Permanent(E),
}

impl<E> BackoffError<E> {
    pub fn into_inner(self) -> E {
        match self {
            BackoffError::Transient(e) | BackoffError::Permanent(e) => e,
        }
    }
}

/// A backoff policy yields sleep intervals until it is exhausted.
pub trait Policy {
    /// Next interval to sleep, or `None` when the attempt budget is spent.
    fn next_interval(&mut self) -> Option<Duration>;
}

pub struct ConstantBackoff {
    interval: Duration,
    max_retries: u32,
    attempts: u32,
}

impl ConstantBackoff {
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
            attempts: 0,
        }
    }
}

impl Policy for ConstantBackoff {
    fn next_interval(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_retries {
            return None;
        }
        self.attempts += 1;
        Some(self.interval)
    }
}

pub struct ExponentialBackoff {
    current: Duration,
    max_interval: Duration,
    max_elapsed_time: Duration,
    started: Instant,
}

const MULTIPLIER: f64 = 1.5;

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            current: config.initial_interval,
            max_interval: config.max_interval,
            max_elapsed_time: config.max_elapsed_time,
            started: Instant::now(),
        }
    }
}

impl Policy for ExponentialBackoff {
    fn next_interval(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= self.max_elapsed_time {
            return None;
        }
        let interval = self.current;
        self.current = self.current.mul_f64(MULTIPLIER).min(self.max_interval);
        Some(interval)
    }
}

/// Runs `op` until it succeeds, fails permanently, or the policy is
/// exhausted. The last error is returned on exhaustion.
pub async fn retry<P, T, E, F, Fut>(policy: &mut P, op: F) -> std::result::Result<T, E>
where
    P: Policy,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, BackoffError<E>>>,
{
    retry_notify(policy, op, |_, _| {}).await
}

/// Like [`retry`], additionally invoking `notify(err, interval)` after each
/// transient failure before sleeping.
pub async fn retry_notify<P, T, E, F, Fut, N>(
    policy: &mut P,
    mut op: F,
    mut notify: N,
) -> std::result::Result<T, E>
where
    P: Policy,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, BackoffError<E>>>,
    N: FnMut(&E, Duration),
{
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(BackoffError::Permanent(e)) => return Err(e),
            Err(BackoffError::Transient(e)) => match policy.next_interval() {
                Some(interval) => {
                    notify(&e, interval);
                    tokio::time::sleep(interval).await;
                }
                None => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let mut policy = ConstantBackoff::new(Duration::from_millis(1), 5);

        let result: std::result::Result<u32, &str> = retry(&mut policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BackoffError::Transient("not yet"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_short_circuits() {
        let attempts = AtomicU32::new(0);
        let mut policy = ConstantBackoff::new(Duration::from_millis(1), 5);

        let result: std::result::Result<(), &str> = retry(&mut policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BackoffError::Permanent("fatal")) }
        })
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_constant_backoff_exhausts_attempts() {
        let attempts = AtomicU32::new(0);
        let mut policy = ConstantBackoff::new(Duration::from_millis(1), 2);

        let result: std::result::Result<(), &str> = retry(&mut policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BackoffError::Transient("down")) }
        })
        .await;

        assert_eq!(result, Err("down"));
        // initial attempt plus two retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_notify_reports_each_failure() {
        let mut notified = Vec::new();
        let mut policy = ConstantBackoff::new(Duration::from_millis(1), 3);
        let attempts = AtomicU32::new(0);

        let result: std::result::Result<(), &str> = retry_notify(
            &mut policy,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BackoffError::Transient("flaky"))
                    } else {
                        Ok(())
                    }
                }
            },
            |err, interval| notified.push((err.to_string(), interval)),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(notified.len(), 2);
    }

    #[test]
    fn test_exponential_intervals_grow_and_cap() {
        let config = BackoffConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(200),
            max_elapsed_time: Duration::from_secs(60),
        };
        let mut policy = ExponentialBackoff::new(&config);

        assert_eq!(policy.next_interval(), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_interval(), Some(Duration::from_millis(150)));
        assert_eq!(policy.next_interval(), Some(Duration::from_millis(200)));
        // capped at max_interval from here on
        assert_eq!(policy.next_interval(), Some(Duration::from_millis(200)));
    }
}
