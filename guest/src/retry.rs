//! Bounded retry for device discovery and mounting.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Fixed attempt count with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op` until it succeeds, the attempts run out, or `cancel` fires.
    ///
    /// At least one attempt is always made. On exhaustion or cancellation
    /// the last error is returned.
    pub async fn run<T, E, F, Fut>(&self, cancel: Option<&CancellationToken>, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= attempts {
                return Err(err);
            }
            trace!(attempt, error = %err, "retrying");
            attempt += 1;

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(err),
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                }
                None => tokio::time::sleep(self.delay).await,
            }
        }
    }
}
