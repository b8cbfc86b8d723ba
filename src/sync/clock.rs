//! Injectable time source and the ticker built on it.
//!
//! Everything in the sync core that reads the time or waits goes through a
//! [`Clock`], so tests can advance virtual time instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task only.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers
#[derive(Debug, Clone, Default)]
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

/// Waits for scheduled instants on a [`Clock`], giving up on shutdown.
#[derive(Clone)]
pub struct Ticker {
    clock: Arc<dyn Clock>,
}

impl Ticker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns `false` if shutdown was requested before `at` was reached.
    pub async fn wait_until(&self, at: DateTime<Utc>, shutdown: &CancellationToken) -> bool {
        let remaining = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return !shutdown.is_cancelled();
        }

        tokio::select! {
            _ = self.clock.sleep(remaining) => !shutdown.is_cancelled(),
            _ = shutdown.cancelled() => false,
        }
    }
}
