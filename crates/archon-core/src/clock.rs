//! Injected clock capability.
//!
//! The scheduler and dispatch handler take an `Arc<dyn Clock>` instead of
//! calling time functions directly, so tests can substitute a fixed or
//! stepped clock for timestamps. Sleeps route through `tokio::time`, which
//! means `#[tokio::test(start_paused = true)]` auto-advances them.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time, used for every persisted timestamp.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// The production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock whose `now()` advances only when told to; sleeps return
/// immediately. Test-only.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(duration).expect("duration fits");
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, _duration: Duration) {}
}
