//! Exponential backoff for the speech producer.
//!
//! Quota and busy errors are retried with a doubling delay; not-found and
//! everything else fail straight away.

use crate::tts::TtsError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, TtsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TtsError>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    "Speech request failed ({}), retry {}/{} in {:?}",
                    e, attempt, policy.max_retries, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn busy() -> TtsError {
        TtsError::Http {
            status: 503,
            message: "model is overloaded".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_doubling_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = calls.clone();
        let result = with_backoff(RetryPolicy::default(), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy())
                } else {
                    Ok("audio")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "audio");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_three_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_backoff(RetryPolicy::default(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TtsError::Http {
                    status: 429,
                    message: "RESOURCE_EXHAUSTED".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(TtsError::Http { status: 429, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_backoff(RetryPolicy::default(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TtsError::Http {
                    status: 404,
                    message: "models/unknown is not found".into(),
                })
            }
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
