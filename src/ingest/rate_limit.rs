// src/ingest/rate_limit.rs
//! Per-provider token buckets. A task waits on its own provider's bucket and nothing else.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::registry::{RateLimit, RateLimitTable};

#[derive(Debug, Clone)]
struct Bucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64,
    last_update: Instant,
}

impl Bucket {
    fn new(limit: &RateLimit) -> Self {
        let capacity = limit.requests.max(1);
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate: capacity as f64 / limit.window_secs.max(1) as f64,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = f64::min(self.capacity as f64, self.tokens + elapsed * self.refill_rate);
        self.last_update = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }
}

#[derive(Debug, Default)]
pub struct ProviderLimiter {
    buckets: DashMap<String, Bucket>,
}

impl ProviderLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Wait for a request slot on `provider`, then for its persisted extra delay.
    /// Providers missing from the table are not throttled.
    pub async fn acquire(&self, provider: &str, table: &RateLimitTable) {
        let Some(limit) = table.get(provider) else {
            return;
        };
        loop {
            // Entry guard must be dropped before sleeping.
            let wait = {
                let mut bucket = self
                    .buckets
                    .entry(provider.to_string())
                    .or_insert_with(|| Bucket::new(&limit));
                bucket.try_take()
            };
            match wait {
                Ok(()) => break,
                Err(d) => tokio::time::sleep(d).await,
            }
        }
        if limit.extra_delay_ms > 0 {
            tokio::time::sleep(limit.extra_delay()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorCfg;
    use std::collections::HashMap;

    fn table(requests: u32, window_secs: u64) -> RateLimitTable {
        let cfg = OrchestratorCfg {
            rate_limit_state_path: None,
            ..Default::default()
        };
        RateLimitTable::new(
            HashMap::from([(
                "p".to_string(),
                RateLimit {
                    requests,
                    window_secs,
                    extra_delay_ms: 0,
                },
            )]),
            &cfg,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_then_waits() {
        let t = table(2, 10);
        let lim = ProviderLimiter::new();
        let t0 = Instant::now();
        lim.acquire("p", &t).await;
        lim.acquire("p", &t).await;
        assert!(t0.elapsed() < Duration::from_millis(1));
        lim.acquire("p", &t).await;
        // refill rate is 0.2 tokens/s, so the third slot costs ~5s of (paused) time
        assert!(t0.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_provider_is_not_throttled() {
        let t = table(1, 60);
        let lim = ProviderLimiter::new();
        let t0 = Instant::now();
        for _ in 0..5 {
            lim.acquire("other", &t).await;
        }
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }
}
