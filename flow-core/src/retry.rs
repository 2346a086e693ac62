//! Bounded fixed-delay retry for store writes

use crate::{config::SyncConfig, metrics::Metrics, Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often and how patiently to retry
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Why a retried operation gave up
#[derive(Debug)]
pub(crate) enum RetryFailure {
    /// Not worth retrying
    Fatal(Error),
    /// Transient failures until the attempt budget ran out
    Exhausted { attempts: u32, last: Error },
}

impl RetryFailure {
    /// Escalate to the error surfaced to callers
    pub fn into_error(self, last_committed_height: Option<u64>) -> Error {
        match self {
            RetryFailure::Fatal(err) => err,
            RetryFailure::Exhausted { attempts, last } => Error::SynchronizationAborted {
                last_committed_height,
                attempts,
                reason: last.to_string(),
            },
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        metrics: Option<&Metrics>,
        mut op: F,
    ) -> std::result::Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match op().await {
                Ok(value) => {
                    if attempts > 1 {
                        info!(operation, attempts, "Store write succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(RetryFailure::Fatal(e)),
                Err(e) => {
                    if attempts >= self.max_attempts {
                        error!(operation, attempts, error = %e, "Store write failed, giving up");
                        return Err(RetryFailure::Exhausted { attempts, last: e });
                    }

                    warn!(
                        operation,
                        attempt = attempts,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Store write failed, retrying in {:?}",
                        self.delay
                    );
                    if let Some(metrics) = metrics {
                        metrics.record_retry();
                    }
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
