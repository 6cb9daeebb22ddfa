use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Longest single nap while waiting for a wall clock deadline. The wall clock
/// can jump (suspend, NTP), so the remaining time is re-measured after each.
const MAX_NAP: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Resolves once `now() >= deadline`.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        loop {
            let Ok(remaining) = (deadline - Utc::now()).to_std() else {
                return;
            };
            if remaining.is_zero() {
                return;
            }
            tokio::time::sleep(remaining.min(MAX_NAP)).await;
        }
    }
}

#[cfg(test)]
pub use manual::ManualClock;
