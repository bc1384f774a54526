//! Reconnection backoff for link supervisors

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of full passes over the server list (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Exponential backoff between connection attempts
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before the next attempt
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current, self.attempt
        );

        sleep(self.current).await;

        self.current = self.next_backoff();

        Ok(())
    }

    // Negative, NaN or overflowing products fall back to the cap
    fn next_backoff(&self) -> Duration {
        Duration::try_from_secs_f64(self.current.as_secs_f64() * self.config.multiplier)
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff)
    }

    /// Call after a successful connection
    pub fn reset(&mut self) {
        self.current = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
