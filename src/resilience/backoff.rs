//! Retry policy and backoff strategies

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest delay ever applied between attempts
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Jitter band applied around the computed delay
const JITTER_FACTOR: f64 = 0.1;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Constant,
}

impl BackoffStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "exponential" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            "constant" => Some(Self::Constant),
            _ => None,
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,
    /// Delay unit the strategy scales
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Spread delays by +/-10% to avoid thundering herds
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 = first retry)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let base = self.base_delay.as_secs_f64();

        let raw = match self.strategy {
            BackoffStrategy::Exponential => base * 2f64.powi(retry as i32 - 1),
            BackoffStrategy::Linear => base * retry as f64,
            BackoffStrategy::Constant => base,
        };

        let max = self.max_delay.as_secs_f64();
        let mut delay = raw.min(max);

        if self.jitter {
            let spread = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
            delay = (delay * (1.0 + spread)).min(max);
        }

        Duration::from_secs_f64(delay.max(MIN_DELAY.as_secs_f64()))
    }
}
