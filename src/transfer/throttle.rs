//! Upload bandwidth limit shared by all workers.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Token bucket in KiB units. One second of traffic may burst.
pub struct Bandwidth {
    limiter: DefaultDirectRateLimiter,
    burst_kib: NonZeroU32,
}

impl std::fmt::Debug for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bandwidth")
            .field("kib_per_sec", &self.burst_kib)
            .finish()
    }
}

impl Bandwidth {
    pub fn new(kib_per_sec: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(kib_per_sec)),
            burst_kib: kib_per_sec,
        }
    }

    /// Wait until `bytes` may be sent.
    pub async fn acquire(&self, bytes: usize) {
        let mut remaining = (bytes as u64).div_ceil(1024).max(1);
        while remaining > 0 {
            let step = remaining.min(u64::from(self.burst_kib.get())) as u32;
            let Some(cells) = NonZeroU32::new(step) else {
                return;
            };
            // `step` never exceeds the burst size, so capacity is sufficient
            if self.limiter.until_n_ready(cells).await.is_err() {
                return;
            }
            remaining -= u64::from(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_burst_is_immediate() {
        let bw = Bandwidth::new(NonZeroU32::new(64).unwrap());
        let started = Instant::now();
        bw.acquire(32 * 1024).await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_over_budget_waits() {
        let bw = Bandwidth::new(NonZeroU32::new(10).unwrap());
        let started = Instant::now();
        // 10 KiB burst, then 10 KiB more at 10 KiB/s
        bw.acquire(20 * 1024).await;
        assert!(started.elapsed() >= Duration::from_millis(800));
    }
}
