use std::time::Duration;

/// Retry policy for object-store operations.
///
/// Backoff is exponential from `base_delay`, capped at `max_delay`, with
/// full jitter: each sleep is drawn uniformly from `[0, capped_delay]`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff ceiling for the given zero-based failure count.
    pub fn delay_cap(&self, failures: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let capped = base_ms
            .saturating_mul(1u64.checked_shl(failures).unwrap_or(u64::MAX))
            .min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }

    /// Sleep with full jitter below the backoff ceiling.
    pub fn sleep(&self, failures: u32) {
        let cap_ms = self.delay_cap(failures).as_millis() as u64;
        let jittered = rand::random::<u64>() % (cap_ms + 1);
        std::thread::sleep(Duration::from_millis(jittered));
    }
}

/// An operation error with its transience classification attached.
///
/// Transient errors (network timeouts, 5xx, throttling) are retried up to
/// the policy's attempt limit; permanent errors (other 4xx, invalid input)
/// fail fast on the first occurrence.
#[derive(Debug)]
pub struct OpError {
    pub message: String,
    pub transient: bool,
}

impl OpError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Retry a closure on transient errors with exponential backoff + full jitter.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    op_name: &str,
    f: impl Fn() -> std::result::Result<T, OpError>,
) -> std::result::Result<T, OpError> {
    let mut last_err: Option<OpError> = None;
    for attempt in 0..policy.max_attempts.max(1) {
        if attempt > 0 {
            policy.sleep(attempt - 1);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.transient && attempt + 1 < policy.max_attempts => {
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max = policy.max_attempts,
                    error = %e,
                    "transient S3 error, retrying"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("retry loop exited without an error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OpError>(42)
        })
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast_policy(), "op", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OpError::transient("flaky"))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_fails_fast() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(OpError::permanent("denied"))
        })
        .unwrap_err();
        assert!(!err.transient);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(OpError::transient("still down"))
        })
        .unwrap_err();
        assert!(err.transient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_cap_doubles_and_saturates() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_cap(0), Duration::from_secs(1));
        assert_eq!(policy.delay_cap(1), Duration::from_secs(2));
        assert_eq!(policy.delay_cap(4), Duration::from_secs(16));
        assert_eq!(policy.delay_cap(10), Duration::from_secs(30));
        assert_eq!(policy.delay_cap(63), Duration::from_secs(30));
    }
}
