//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use crate::config::PollPolicy;

/// Poll `predicate` until it returns true or `max_attempts` checks have failed.
///
/// The predicate is checked at least once. Between failed checks the task
/// sleeps for `interval`. Returns whether the predicate was satisfied.
pub async fn wait_until<F, Fut>(mut predicate: F, interval: Duration, max_attempts: u32) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        if predicate().await {
            return true;
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    false
}

/// [`wait_until`] driven by a [`PollPolicy`].
pub async fn wait_with<F, Fut>(predicate: F, policy: PollPolicy) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_until(predicate, policy.interval(), policy.max_attempts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_returns_true_once_satisfied() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let ok = wait_until(
            move || async move { calls.fetch_add(1, Ordering::SeqCst) + 1 >= 3 },
            Duration::from_millis(1),
            10,
        )
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let ok = wait_until(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                false
            },
            Duration::from_millis(1),
            4,
        )
        .await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_checks_once() {
        let ok = wait_with(|| async { true }, PollPolicy::new(1, 0)).await;
        assert!(ok);
    }
}
