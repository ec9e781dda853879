use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

/// Polls `check` until it yields a value. Uses tokio's clock, so it also works
/// under `start_paused` where sleeping auto-advances time.
pub async fn eventually<T, F, Fut>(description: &str, timeout: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for {description}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
