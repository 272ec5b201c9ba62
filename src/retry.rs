use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreakerManager;
use crate::error::Result;

/// Constant backoff: up to `attempts` extra tries, `delay` apart.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            delay: Duration::from_millis(10),
        }
    }
}

pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    use backoff::backoff::{Backoff, Constant};

    let mut backoff = Constant::new(config.delay);
    let mut retry_count = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retry_count > 0 {
                    debug!(
                        "Operation '{}' succeeded after {} retries",
                        operation_name, retry_count
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if !error.is_retryable() || retry_count >= config.attempts {
                    warn!(
                        "Operation '{}' failed after {} retries: {}",
                        operation_name, retry_count, error
                    );
                    return Err(error);
                }

                retry_count += 1;
                crate::metrics::record_retry(operation_name);

                let duration = backoff.next_backoff().unwrap_or(config.delay);
                warn!(
                    "Operation '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                    operation_name, retry_count, config.attempts, duration, error
                );
                tokio::time::sleep(duration).await;
            }
        }
    }
}

/// Runs the whole retry loop inside the named breaker, so a call that
/// exhausts its retries counts once against the circuit.
pub async fn with_breaker_and_retry<F, Fut, T>(
    manager: &CircuitBreakerManager,
    breaker: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    manager
        .call(breaker, || with_retry(breaker, config, operation))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::error::ServiceError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config() -> RetryConfig {
        RetryConfig {
            attempts: 2,
            delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = with_retry("test_operation", &config(), || {
            let attempts = attempts_clone.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(ServiceError::Broker("queue full".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<()> = with_retry("test_operation", &config(), || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Broker("queue full".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(ServiceError::Broker(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<()> = with_retry("test_operation", &config(), || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Configuration("non-retryable".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_counts_exhausted_retries_once() {
        let manager = CircuitBreakerManager::new();
        manager.configure(
            "broker",
            CircuitBreakerConfig {
                request_volume_threshold: 1,
                ..Default::default()
            },
        );

        let result: Result<()> = with_breaker_and_retry(&manager, "broker", &config(), || async {
            Err(ServiceError::Broker("down".to_string()))
        })
        .await;

        assert!(result.is_err());
        let stats = manager.stats("broker").unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(manager.state("broker"), Some(CircuitState::Open));
    }
}
