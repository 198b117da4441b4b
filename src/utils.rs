use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::models::retry::RetryConfig;

/// Runs `operation` until it succeeds or `max_attempts` is spent. Waits
/// between attempts grow by `backoff_multiplier` up to `max_delay_ms`.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay_ms = config.initial_delay_ms;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "Operation recovered after retrying");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        attempts = config.max_attempts,
                        error = %e,
                        "Giving up after exhausting retry attempts"
                    );
                    return Err(e);
                }

                debug!(attempt, delay_ms, error = %e, "Attempt failed, backing off");
                sleep(jittered(delay_ms)).await;

                attempt += 1;
                delay_ms = (delay_ms * config.backoff_multiplier).min(config.max_delay_ms);
            }
        }
    }
}

/// The nominal delay spread by ±10%, so a fleet restarting together does
/// not reconnect in lockstep.
fn jittered(delay_ms: u64) -> Duration {
    let jitter = rand::random_range(-0.1..=0.1);
    Duration::from_millis((delay_ms as f64 * (1.0 + jitter)) as u64)
}
