//! Retry utilities: backoff builders for startup connections.
//!
//! Uses `backon` for exponential backoff with jitter. Only startup connection
//! establishment retries; publish and send never do.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for broker connection attempts at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Total attempts: `attempts` (the first try plus `attempts - 1` retries)
/// - Jitter enabled
pub fn connection_backoff(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(attempts.saturating_sub(1))
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::{BackoffBuilder, Retryable};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_connection_backoff_bounds_retries() {
        let delays: Vec<_> = connection_backoff(5).build().collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
    }

    #[test]
    fn test_single_attempt_means_no_retry() {
        assert_eq!(connection_backoff(1).build().count(), 0);
        assert_eq!(connection_backoff(0).build().count(), 0);
    }

    #[tokio::test]
    async fn test_retry_stops_after_attempts() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), &str> = (|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("refused")
        })
        .retry(
            connection_backoff(3)
                .with_min_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(2)),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
