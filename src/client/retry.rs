//! # Backoff Strategies
//!
//! Delay schedules for the two places the engine retries on its own:
//! re-establishing a dropped change feed, and presence writes (typing and
//! read cursors) that hit a transient failure. Message sends are never
//! retried automatically; a failed send waits for the user.
//!
//! ## Features
//!
//! - **Exponential Backoff**: delays double from a base up to a cap
//! - **Jitter**: optional randomness against reconnect storms
//! - **Max Attempts**: [`RetryPolicy`] bounds presence retries
//!
//! ## Usage
//!
//! ```rust
//! use chatsync::client::retry::BackoffStrategy;
//! use std::time::Duration;
//!
//! let backoff = BackoffStrategy::exponential(Duration::from_secs(1), Duration::from_secs(30));
//! assert_eq!(backoff.delay(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay(3), Duration::from_secs(4));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::client::error::Result;

/// Backoff strategy configuration
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed interval between attempts
    Fixed(Duration),
    /// Exponential backoff with jitter
    Exponential {
        /// First delay
        base: Duration,
        /// Maximum delay
        max: Duration,
        /// Jitter factor (0.0 to 1.0), added on top of the delay
        jitter: f64,
    },
}

impl BackoffStrategy {
    /// Exponential backoff without jitter
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential { base, max, jitter: 0.0 }
    }

    pub fn with_jitter(self, factor: f64) -> Self {
        match self {
            Self::Exponential { base, max, .. } => Self::Exponential {
                base,
                max,
                jitter: factor.clamp(0.0, 1.0),
            },
            fixed => fixed,
        }
    }

    /// Delay before attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(interval) => *interval,
            Self::Exponential { base, max, jitter } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                let delay = base.saturating_mul(factor).min(*max);
                if *jitter <= 0.0 {
                    return delay;
                }
                let spread = delay.mul_f64(*jitter);
                let extra = rand::thread_rng().gen_range(Duration::ZERO..=spread);
                delay + extra
            }
        }
    }
}

/// Bounded retry of transient failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub backoff: BackoffStrategy,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffStrategy::exponential(Duration::from_millis(500), Duration::from_secs(5)),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Run `call` until it succeeds, fails with a non-transient error, or
    /// runs out of attempts.
    pub async fn run<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    tracing::debug!("[OUTBOX] attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
