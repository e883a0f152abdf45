//! Request pacing for the metadata API.
//!
//! The upstream enforces one global requests-per-minute ceiling. Each
//! [`RateLimiter`] belongs to one client instance and spaces request
//! starts at least `60s / rpm` apart.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// A limiter allowing `requests_per_minute` request starts per minute.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1) as u64;
        Self::with_interval(Duration::from_millis(60_000 / rpm))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until the next request may start, then claims that slot.
    pub async fn acquire(&self) {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        let start = match *next {
            Some(slot) if slot > now => {
                tokio::time::sleep_until(slot).await;
                slot
            }
            _ => now,
        };
        *next = Some(start + self.interval);
    }
}
