//! Provides backoff timing control for reconnecting watch streams.
use std::time::Duration;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
    /// Waits the prescribed amount of time (as per `next_duration`).
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// A `BackoffStrategy` in which the durations double on every failure.
///
/// There is no upper bound: the supervisor never gives up on a watch
/// stream, so the delay keeps growing (saturating) until the next
/// successful attempt resets it.
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl ExponentialBackoffStrategy {
    /// Creates a strategy starting at `base_duration`.
    pub fn new(base_duration: Duration) -> Self {
        Self {
            base_duration,
            last_duration: Duration::from_secs(0),
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
    }

    fn next_duration(&mut self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration.saturating_mul(2)
        };
        self.last_duration = next_duration;
        next_duration
    }
}
