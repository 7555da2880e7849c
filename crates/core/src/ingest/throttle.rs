//! Process-wide token bucket for outbound provider requests.
//!
//! Shared by every fetch task through an `Arc`; it caps request starts per
//! second and never retries anything.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RequestThrottle {
    bucket: Mutex<Bucket>,
    rate_per_sec: f64,
    capacity: f64,
}

impl RequestThrottle {
    /// `None` when `requests_per_sec` is zero (throttling disabled).
    pub fn new(requests_per_sec: u32) -> Option<Self> {
        if requests_per_sec == 0 {
            return None;
        }
        let capacity = f64::from(requests_per_sec);
        Some(Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            rate_per_sec: capacity,
            capacity,
        })
    }

    /// Waits until a request slot is available and consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
