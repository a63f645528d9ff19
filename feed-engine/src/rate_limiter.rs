use crate::feed_utils;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Per-origin request spacing shared by every subscription.
///
/// Each `acquire` reserves the next free slot for the origin and returns
/// how long the caller has to wait for it, so concurrent callers queue up
/// behind each other instead of racing for the same slot.
#[derive(Clone)]
pub struct RateLimiter {
    min_spacing: Duration,
    slots: Arc<Mutex<HashMap<String, Instant>>>,
}

impl RateLimiter {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reserves the next request slot for `origin` and returns the wait
    /// before it may be issued (zero when the origin is idle).
    pub async fn acquire(&self, origin: &str) -> Duration {
        self.reserve_at(origin, Instant::now()).await
    }

    pub async fn reserve_at(&self, origin: &str, now: Instant) -> Duration {
        let mut slots = self.slots.lock().await;
        let slot = match slots.get(origin) {
            Some(last) => (*last + self.min_spacing).max(now),
            None => now,
        };
        slots.insert(origin.to_string(), slot);
        slot.saturating_duration_since(now)
    }

    /// Acquires a slot for the URL's origin and sleeps until it opens.
    pub async fn wait_for_url(&self, url: &str) -> Duration {
        let origin = feed_utils::url::origin(url).unwrap_or_else(|| url.to_string());
        let wait = self.acquire(&origin).await;
        if !wait.is_zero() {
            debug!(origin = %origin, wait_ms = wait.as_millis() as u64, "rate limiting request");
            tokio::time::sleep(wait).await;
        }
        wait
    }
}
