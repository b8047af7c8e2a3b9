//! Shared activity-touch throttle: coalesces frequent activity signals from
//! the data plane into at most one catalog write per sandbox per window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

const THROTTLE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct ActivityThrottle {
    last_write: Mutex<HashMap<Uuid, Instant>>,
}

impl ActivityThrottle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns `true` if the caller should perform a catalog write now —
    /// i.e. no write has been recorded for this sandbox within the window.
    pub async fn should_write(&self, sandbox_id: Uuid) -> bool {
        let mut last_write = self.last_write.lock().await;
        let now = Instant::now();
        match last_write.get(&sandbox_id) {
            Some(&last) if now.duration_since(last) < THROTTLE_WINDOW => false,
            _ => {
                last_write.insert(sandbox_id, now);
                true
            }
        }
    }

    pub async fn forget(&self, sandbox_id: Uuid) {
        self.last_write.lock().await.remove(&sandbox_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coalesces_writes_within_window() {
        let throttle = ActivityThrottle::new();
        let id = Uuid::new_v4();

        assert!(throttle.should_write(id).await);
        for _ in 0..99 {
            assert!(!throttle.should_write(id).await);
        }
    }

    #[tokio::test]
    async fn allows_write_after_forgetting() {
        let throttle = ActivityThrottle::new();
        let id = Uuid::new_v4();
        assert!(throttle.should_write(id).await);
        throttle.forget(id).await;
        assert!(throttle.should_write(id).await);
    }
}
