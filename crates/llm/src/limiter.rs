//! Per-adapter request pacing and bounded retry.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Simple interval limiter: at most `requests_per_second` acquisitions per
/// second, enforced by spacing consecutive requests.  All calls routed
/// through one adapter share the same limiter, so embedding traffic and the
/// `continuity_memory_upsert` pathway drain from the same pool.
pub struct RateLimiter {
    interval: Option<Duration>,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// `requests_per_second <= 0` disables limiting.
    pub fn new(requests_per_second: f64) -> Self {
        let interval = (requests_per_second > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / requests_per_second));
        Self { interval, next_slot: Mutex::new(Instant::now()) }
    }

    /// Wait until the next request slot is available.
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else { return };
        let wake_at = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + interval;
            slot
        };
        // Sleep outside the lock so waiting requests queue fairly.
        tokio::time::sleep_until(wake_at).await;
    }
}

/// Maximum attempts for transient remote failures.
pub const MAX_ATTEMPTS: u32 = 3;

/// Run `op` up to [`MAX_ATTEMPTS`] times with exponential backoff plus
/// jitter.  Only the final error is returned; intermediate failures are
/// logged at warn level.
pub async fn with_retries<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let base = Duration::from_millis(200u64 << attempt);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..150));
            debug!(label, attempt, ?base, "retrying after backoff");
            tokio::time::sleep(base + jitter).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(label, attempt, %err, "remote call failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{label}: retries exhausted")))
}
