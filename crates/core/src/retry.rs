use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Classification of a failed attempt. Transient failures (server-side
/// errors, timeouts) are retried with doubling backoff; terminal failures
/// (client-side rejections) are returned immediately.
#[derive(Debug)]
pub enum Attempt<E> {
    Transient(E),
    Terminal(E),
}

impl<E> Attempt<E> {
    pub fn into_inner(self) -> E {
        match self {
            Attempt::Transient(error) | Attempt::Terminal(error) => error,
        }
    }
}

/// Run `op` up to `attempts` times, sleeping `base_delay * 2^(n-1)` between
/// the n-th failure and the next attempt. Only transient failures are
/// retried.
pub async fn retry_with_backoff<T, E, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut delay = base_delay;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Terminal(error)) => return Err(error),
            Err(Attempt::Transient(error)) => {
                if attempt == attempts {
                    return Err(error);
                }
                warn!(
                    label,
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }

    unreachable!("retry loop returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(3, Duration::from_millis(1), "test", || async {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    Err(Attempt::Transient("not yet".to_string()))
                } else {
                    Ok(call)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(5, Duration::from_millis(1), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Attempt::Terminal("client error".to_string()))
            })
            .await;

        assert_eq!(result.unwrap_err(), "client error");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(3, Duration::from_millis(1), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Attempt::Transient("still down".to_string()))
            })
            .await;

        assert_eq!(result.unwrap_err(), "still down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
