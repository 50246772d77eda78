//! Optional bandwidth cap shared by every chunk of a batch.
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};

pub type ArcRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Byte-rate limiter that accepts requests of any size.
///
/// `governor` refuses single requests larger than its burst, so large
/// payloads are admitted piece by piece.
#[derive(Clone)]
pub struct Throttle {
    limiter: ArcRateLimiter,
    burst: NonZeroU32,
}

impl Throttle {
    /// `None` when `bytes_per_sec` is zero.
    pub fn per_second(bytes_per_sec: u32) -> Option<Self> {
        let burst = NonZeroU32::new(bytes_per_sec)?;
        Some(Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(burst))),
            burst,
        })
    }

    /// Waits until `len` more bytes may pass.
    pub async fn admit(&self, len: usize) {
        let mut remaining = len as u64;
        while remaining > 0 {
            let step = remaining.min(u64::from(self.burst.get())) as u32;
            if let Some(n) = NonZeroU32::new(step) {
                // `step` never exceeds the burst, so this cannot fail.
                let _ = self.limiter.until_n_ready(n).await;
            }
            remaining -= u64::from(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_disables_throttle() {
        assert!(Throttle::per_second(0).is_none());
    }

    #[tokio::test]
    async fn test_admits_requests_larger_than_burst() {
        let throttle = Throttle::per_second(4096).unwrap();
        let started = tokio::time::Instant::now();
        // One full burst is available at once, the rest has to wait.
        throttle.admit(4096 + 1024).await;
        assert!(started.elapsed() >= std::time::Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_empty_request_passes() {
        let throttle = Throttle::per_second(16).unwrap();
        throttle.admit(0).await;
    }
}
