use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{debug, warn};
use tokio::time::Instant;

/// Re-runs `verify_fn` until it reports `Ok(true)`, fails, or `timeout` elapses.
///
/// The closure should return:
/// - `Ok(true)` if verification succeeded
/// - `Ok(false)` if verification should be retried
/// - `Err(_)` if verification should fail immediately (no retry)
pub async fn retry_provider_verification<F, Fut>(
    record_name: &str,
    operation: &str,
    timeout: Duration,
    interval: Duration,
    mut verify_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        debug!(
            "[provider-retry] {} verification attempt {} for {}",
            operation, attempt, record_name
        );

        match verify_fn().await {
            Ok(true) => {
                debug!(
                    "[provider-retry] {} verified after {}ms (attempt {})",
                    operation,
                    started.elapsed().as_millis(),
                    attempt
                );
                return Ok(());
            }
            Ok(false) => {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    warn!(
                        "[provider-retry] {} verification timeout after {}ms (attempt {})",
                        operation,
                        elapsed.as_millis(),
                        attempt
                    );
                    return Err(anyhow!(
                        "{} verification failed for {}: timeout after {}ms",
                        operation,
                        record_name,
                        elapsed.as_millis()
                    ));
                }
                let wait = interval.min(timeout.saturating_sub(elapsed));
                debug!(
                    "[provider-retry] {} not yet verified, waiting {}ms",
                    operation,
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                warn!(
                    "[provider-retry] {} verification failed immediately: {:#}",
                    operation, err
                );
                return Err(err);
            }
        }
    }
}
