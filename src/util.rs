//! Shared utility functions for the rigger crate.

use std::future::Future;
use std::time::Duration;

/// Run `op` up to `attempts` times, sleeping between attempts.
///
/// The first delay is `base_delay`; each subsequent delay is multiplied by
/// `multiplier`. The final attempt's error is returned unchanged. Every
/// retrying caller in the crate (package installs, consumer health
/// re-checks) goes through this one helper.
pub async fn retry<T, E, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = base_delay;
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt == attempts => return Err(err),
            Err(_) => {
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * multiplier);
            }
        }
    }
    unreachable!("retry loop always returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success_without_extra_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(3, Duration::from_millis(1), 2.0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(3, Duration::from_millis(1), 1.0, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("not yet") } else { Ok(n) } }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(2, Duration::from_millis(1), 1.5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("attempt {n}")) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_is_clamped_to_one() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry(0, Duration::from_millis(1), 1.0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("no") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
