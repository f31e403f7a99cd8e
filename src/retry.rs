//! Retry combinators for API writes.
//!
//! Two shapes of retry are used by the controller:
//!
//! - [`with_optimistic_retry`] re-reads an object and re-applies a mutation when
//!   the write loses a resourceVersion race. There is no backoff; the retry
//!   works because the fresh read carries the new version.
//! - [`retry_with_backoff`] retries any failing operation with exponential
//!   backoff and jitter. Used for startup work such as CRD installation.
//!
//! # Example
//!
//! ```ignore
//! use atlas::retry::with_optimistic_retry;
//!
//! let written = with_optimistic_retry(
//!     5,
//!     "patch_status",
//!     || async { kube.get_app(name, ns).await },
//!     |current| async move { kube.patch_app_status(name, ns, rv(&current), &status).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
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
}

/// Fetch-then-write loop that retries only on optimistic-concurrency conflicts.
///
/// Each attempt calls `fetch` for a fresh snapshot and hands it to `apply`.
/// A conflict from `apply` starts another attempt, up to `max_attempts` in
/// total. Any other error, including one from `fetch`, is returned at once.
pub async fn with_optimistic_retry<S, T, F, FFut, A, AFut>(
    max_attempts: u32,
    operation: &str,
    mut fetch: F,
    mut apply: A,
) -> Result<T, Error>
where
    F: FnMut() -> FFut,
    FFut: Future<Output = Result<S, Error>>,
    A: FnMut(S) -> AFut,
    AFut: Future<Output = Result<T, Error>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let snapshot = fetch().await?;

        match apply(snapshot).await {
            Ok(written) => return Ok(written),
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                debug!(
                    operation = %operation,
                    attempt = attempt,
                    "Write conflicted, re-reading"
                );
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(
                        operation = %operation,
                        attempts = attempt,
                        "Conflict retries exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or up to `max_attempts` if set, returning the last
/// error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn conflict() -> Error {
        Error::conflict("AtlasApp", "dev/web", "the object has been modified")
    }

    #[tokio::test]
    async fn conflict_once_then_success_refetches() {
        let fetches = Arc::new(AtomicU32::new(0));
        let writes = Arc::new(AtomicU32::new(0));
        let f = fetches.clone();
        let w = writes.clone();

        let result = with_optimistic_retry(
            5,
            "patch_status",
            || {
                let f = f.clone();
                async move { Ok(f.fetch_add(1, Ordering::SeqCst)) }
            },
            |version| {
                let w = w.clone();
                async move {
                    w.fetch_add(1, Ordering::SeqCst);
                    if version == 0 {
                        Err(conflict())
                    } else {
                        Ok(version)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conflict_retries_are_bounded() {
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();

        let result: Result<(), Error> = with_optimistic_retry(
            3,
            "patch_status",
            || async { Ok(()) },
            |_| {
                let w = w.clone();
                async move {
                    w.fetch_add(1, Ordering::SeqCst);
                    Err(conflict())
                }
            },
        )
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_conflict_errors_are_not_retried() {
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();

        let result: Result<(), Error> = with_optimistic_retry(
            5,
            "patch_status",
            || async { Ok(()) },
            |_| {
                let w = w.clone();
                async move {
                    w.fetch_add(1, Ordering::SeqCst);
                    Err(Error::transient("AtlasApp", "dev/web", "connection reset"))
                }
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Transient { .. })));
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_short_circuits() {
        let result: Result<(), Error> = with_optimistic_retry(
            5,
            "patch_status",
            || async { Err::<(), _>(Error::not_found("AtlasApp", "dev/web")) },
            |_| async { Ok(()) },
        )
        .await;

        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn zero_bound_still_attempts_once() {
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();

        let result = with_optimistic_retry(
            0,
            "patch_status",
            || async { Ok(()) },
            |_| {
                let w = w.clone();
                async move {
                    w.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "install_crd", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("api server unavailable")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "install_crd", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
