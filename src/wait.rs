//! Readiness waiting with exponential backoff and cancellation
//!
//! Managed-resource creation routinely takes multi-second to multi-minute
//! latencies (a Cloud SQL instance can take ten minutes). This module
//! provides the shared polling loop used for long-running operations and
//! service readiness, with exponential backoff and cooperative cancellation.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use backon::{BackoffBuilder, ExponentialBuilder};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for readiness polling
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Initial delay between checks
    pub initial_delay: Duration,
    /// Maximum delay between checks (cap for exponential growth)
    pub max_delay: Duration,
    /// Maximum total time to wait before giving up
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
        }
    }
}

impl WaitConfig {
    /// A config with the given total timeout and default delays.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Poll `check` until it reports ready, the timeout elapses, or `cancel`
/// fires.
///
/// `check` returns `Ok(true)` when ready, `Ok(false)` to keep waiting, and
/// `Err` to abort immediately. Delays follow `backon`'s jittered exponential
/// schedule between `initial_delay` and `max_delay`.
pub async fn wait_for_resource<F, Fut>(
    config: WaitConfig,
    cancel: Option<&CancellationToken>,
    check: F,
    resource_name: &str,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = std::time::Instant::now();
    let mut delays = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_jitter()
        .without_max_times()
        .build();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        if let Some(token) = cancel {
            if token.is_cancelled() {
                anyhow::bail!("wait for {resource_name} cancelled");
            }
        }

        if start.elapsed() >= config.timeout {
            anyhow::bail!(
                "timeout waiting for {} after {:?} ({} attempts)",
                resource_name,
                config.timeout,
                attempts
            );
        }

        if check().await? {
            debug!(resource = %resource_name, attempts, "Resource ready");
            return Ok(());
        }

        let delay = delays.next().unwrap_or(config.max_delay);
        debug!(
            resource = %resource_name,
            attempt = attempts,
            delay_ms = delay.as_millis(),
            "Resource not ready, waiting"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = async {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                anyhow::bail!("wait for {resource_name} cancelled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> WaitConfig {
        WaitConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn ready_immediately() {
        let result =
            wait_for_resource(fast_config(), None, || async { Ok(true) }, "db-instance").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn retries_until_ready() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        wait_for_resource(
            fast_config(),
            None,
            || {
                let c = counter_clone.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
            "db-instance",
        )
        .await
        .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out() {
        let config = WaitConfig {
            timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let err = wait_for_resource(config, None, || async { Ok(false) }, "service")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let err = wait_for_resource(
            WaitConfig::with_timeout(Duration::from_secs(30)),
            Some(&cancel),
            || async { Ok(false) },
            "service",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn check_error_aborts() {
        let err = wait_for_resource(
            fast_config(),
            None,
            || async { anyhow::bail!("permission denied") },
            "secret",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }
}
