use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::error::{OracleError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll `probe` until it yields a value or `timeout` elapses.
///
/// The probe always runs at least once, so a condition that already holds
/// returns immediately. Probe errors abort the wait.
pub async fn poll_until<T, F, Fut>(timeout: Duration, what: &str, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = probe().await? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(what, attempts, "wait timed out");
            return Err(OracleError::Timeout(format!(
                "Timeout {}ms exceeded waiting for {}",
                timeout.as_millis(),
                what
            )));
        }

        sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}
