//! Sleep port used by status polling
//!
//! Polling waits through this trait so tests can record the requested
//! delays instead of sleeping.

use std::time::Duration;

use async_trait::async_trait;

/// Port for waiting between status requests
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
