use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Wall clock for history timestamps, driven by tokio's monotonic clock.
///
/// Wall time is read once, when the clock is created, and advanced with
/// `tokio::time::Instant` afterwards. Timestamps and `tokio::time::sleep` therefore
/// agree, including under a paused test runtime.
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self {
            wall_anchor: Utc::now(),
            instant_anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.instant_anchor.elapsed()).unwrap_or(TimeDelta::MAX);
        self.wall_anchor
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Suspends the current task until `deadline`. Returns at once if it has passed.
    pub async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - self.now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}
