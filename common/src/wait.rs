use anyhow::{Result, bail};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_WAIT_ITERATIONS: usize = 50;
const DEFAULT_CAP: Duration = Duration::from_secs(10);
const BASE_DELAY: Duration = Duration::from_millis(250);

/// `n` rounds of jittered backoff with the default cap, interruptible by
/// cancellation. Used between retries of filesystem cleanup that may be
/// blocked by open handles.
pub async fn wait(cancel: &CancellationToken, n: usize) -> Result<()> {
    wait_with_backoff(cancel, n, DEFAULT_CAP).await
}

/// Sleep through `n` rounds of capped exponential backoff with full
/// jitter: each round sleeps a uniform random duration in
/// `[0, min(cap, base * 2^round)]`. Full jitter keeps concurrent retriers
/// from falling into lockstep.
pub async fn wait_with_backoff(cancel: &CancellationToken, n: usize, cap: Duration) -> Result<()> {
    let n = n.clamp(1, MAX_WAIT_ITERATIONS);

    for attempt in 0..n {
        let delay = backoff_full_jitter(BASE_DELAY, cap, attempt);

        tokio::select! {
            _ = cancel.cancelled() => bail!("Context cancelled"),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    Ok(())
}

pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    // Work in millis so base * 2^attempt cannot overflow a Duration.
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    // A zero upper bound would make random_range panic.
    let upper = exp_ms.min(cap_ms).max(1);

    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}
