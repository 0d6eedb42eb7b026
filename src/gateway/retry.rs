use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use super::error::GatewayError;

/// One retry policy shared by every gateway operation: bounded attempts,
/// exponential backoff, connection errors only.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (1-based):
    /// base_delay doubled per completed attempt, capped at max_delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        (self.base_delay * factor).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let quarter = delay.as_millis() as u64 / 4;
        if quarter == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..quarter))
    }

    /// Runs `op`, retrying retryable errors up to `max_attempts` total
    /// attempts with exponential backoff between them.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.jittered(self.delay_for(attempt));
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying gateway operation"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
