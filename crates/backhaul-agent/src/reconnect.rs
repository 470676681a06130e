//! Backoff between control-stream connection attempts

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How the agent spaces out reconnection attempts
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    #[serde(with = "backhaul_proto::duration_secs")]
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    #[serde(with = "backhaul_proto::duration_secs")]
    pub max_backoff: Duration,
    /// Growth factor per consecutive failure (values below 1.0 act as 1.0)
    pub multiplier: f64,
    /// Consecutive failures tolerated before giving up (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay to apply after `failures` consecutive failed attempts
    pub fn delay_after(&self, failures: usize) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let max = self.max_backoff.max(self.initial_backoff);

        if secs.is_finite() && secs < max.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            max
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnection attempts")]
    MaxAttemptsReached(usize),

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Counts consecutive failures and sleeps accordingly
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    failures: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failed attempt and sleep before the next one.
    ///
    /// Returns `Cancelled` as soon as `cancel` fires, and
    /// `MaxAttemptsReached` without sleeping once the limit is exceeded.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.failures += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.failures > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(max_attempts));
            }
        }

        let delay = self.config.delay_after(self.failures);
        debug!(failures = self.failures, ?delay, "Backing off before reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Forget past failures after a successful registration
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures recorded so far
    pub fn attempt(&self) -> usize {
        self.failures
    }

    /// Delay the next [`wait`](Self::wait) will apply
    pub fn current_backoff(&self) -> Duration {
        self.config.delay_after(self.failures + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn config(max_attempts: Option<usize>) -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = config(None);
        let delays: Vec<u64> = (1..=6)
            .map(|failures| config.delay_after(failures).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100, 100]);
        assert_eq!(config.delay_after(10_000), Duration::from_millis(100));
    }

    #[test]
    fn test_multiplier_below_one_is_constant() {
        let config = ReconnectConfig {
            multiplier: 0.5,
            ..config(None)
        };
        assert_eq!(config.delay_after(5), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_backoff() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(config(None));
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));

        let start = Instant::now();
        manager.wait(&cancel).await.unwrap();
        manager.wait(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(30));
        assert_eq!(manager.attempt(), 2);
        assert_eq!(manager.current_backoff(), Duration::from_millis(40));

        manager.reset();
        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(config(Some(2)));

        manager.wait(&cancel).await.unwrap();
        manager.wait(&cancel).await.unwrap();
        assert_eq!(
            manager.wait(&cancel).await,
            Err(ReconnectError::MaxAttemptsReached(2))
        );
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(ReconnectConfig {
            initial_backoff: Duration::from_secs(3600),
            ..ReconnectConfig::default()
        });

        cancel.cancel();
        assert_eq!(manager.wait(&cancel).await, Err(ReconnectError::Cancelled));
    }

    #[test]
    fn test_deserialize() {
        let config: ReconnectConfig =
            serde_yaml::from_str("initial_backoff: 0.5\nmax_attempts: 10\n").unwrap();
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
        assert_eq!(config.max_attempts, Some(10));
    }
}
