//! Retry with exponential back-off and jitter for idempotent backend reads.
//!
//! Only the inventory and status fetches go through here. Reports are sent
//! exactly once.

use std::future::Future;
use std::time::Duration;

use crate::error::BackendError;

/// Returns `true` for errors that are worth retrying after a back-off delay.
///
/// **Retriable:**
/// - Transport failures: request timeout, refused or reset connection.
/// - Any 5xx from the backend, whether surfaced by `reqwest` or by the
///   status check in [`BackendError::UnexpectedStatus`].
///
/// **Returned at once:**
/// - 4xx responses. A 401 or 403 means the shared secret is wrong, and a
///   second attempt sends the same secret.
/// - [`BackendError::Deserialize`]. The inventory schema changed under us.
/// - [`BackendError::InvalidUrl`]. A configuration mistake.
pub(crate) fn is_retriable(err: &BackendError) -> bool {
    match err {
        BackendError::Http(e) => {
            e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
        }
        BackendError::UnexpectedStatus { status, .. } => *status >= 500,
        BackendError::Deserialize { .. } | BackendError::InvalidUrl { .. } => false,
    }
}

/// Runs `operation` with up to `max_retries` additional attempts on transient errors.
///
/// Back-off schedule with the client defaults (`max_retries = 2`,
/// `backoff_base_ms = 1_000`):
///
/// | Retry | Sleep before the attempt |
/// |-------|--------------------------|
/// | 1     | 1 000 ms ± 25 % jitter   |
/// | 2     | 2 000 ms ± 25 % jitter   |
///
/// Each sleep is capped at 30 s before jitter is applied. The backend is
/// read at most a handful of times per round, so the cap only matters when a
/// caller raises the base delay through
/// [`BackendClient::with_retry_policy`](crate::BackendClient::with_retry_policy).
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    max_retries: u32,
    backoff_base_ms: u64,
    mut operation: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    const MAX_DELAY_MS: u64 = 30_000;
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retriable(&err) || attempt >= max_retries {
                    return Err(err);
                }
                attempt += 1;
                let computed = backoff_base_ms.saturating_mul(1u64 << (attempt - 1).min(10));
                let capped = computed.min(MAX_DELAY_MS);
                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    clippy::cast_precision_loss
                )]
                let delay_ms = (capped as f64 * (rand::random::<f64>() * 0.5 + 0.75)) as u64;
                tracing::warn!(
                    attempt,
                    max_retries,
                    delay_ms,
                    error = %err,
                    "backend transient error, retrying after back-off"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn server_error() -> BackendError {
        BackendError::UnexpectedStatus {
            status: 503,
            url: "http://backend/clinics".to_owned(),
            body: String::new(),
        }
    }

    #[test]
    fn server_errors_are_retriable() {
        assert!(is_retriable(&server_error()));
    }

    #[test]
    fn client_errors_are_not_retriable() {
        assert!(!is_retriable(&BackendError::UnexpectedStatus {
            status: 403,
            url: "http://backend/clinics".to_owned(),
            body: "bad secret".to_owned(),
        }));
    }

    #[test]
    fn deserialize_error_is_not_retriable() {
        let source = serde_json::from_str::<()>("invalid").unwrap_err();
        assert!(!is_retriable(&BackendError::Deserialize {
            context: "test".to_owned(),
            source,
        }));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = retry_with_backoff(3, 0, || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(server_error())
                } else {
                    Ok::<u32, BackendError>(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = retry_with_backoff(1, 0, || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(server_error())
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result,
            Err(BackendError::UnexpectedStatus { status: 503, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn default_schedule_sleeps_about_one_then_two_seconds() {
        let start = tokio::time::Instant::now();
        let result =
            retry_with_backoff(2, 1_000, || async { Err::<u32, _>(server_error()) }).await;
        let waited = start.elapsed();

        assert!(result.is_err());
        // 750..=1250 ms plus 1500..=2500 ms of jitter-adjusted sleep.
        assert!(waited >= Duration::from_millis(2_250), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(3_750), "waited {waited:?}");
    }

    #[tokio::test]
    async fn invalid_url_is_returned_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = retry_with_backoff(3, 0, || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(BackendError::InvalidUrl {
                    url: "not a url".to_owned(),
                    reason: "relative URL without a base".to_owned(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(BackendError::InvalidUrl { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
