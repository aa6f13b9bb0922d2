//! Requeue delays for failing reconciles.
//!
//! Retries are never done in-process: a failed reconcile returns and the
//! controller requeues the key after [`FailureTracker::record_failure`]'s
//! delay. Delays grow exponentially per object key with 0.5x..1.5x jitter so
//! objects failing together do not retry in lockstep.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

/// Shape of the exponential backoff curve
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound before jitter
    pub max_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Un-jittered delay for the `attempt`-th consecutive failure (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay for the `attempt`-th consecutive failure
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(self.base_delay(attempt).as_secs_f64() * jitter)
    }
}

/// Consecutive failure counts per object key
#[derive(Debug, Default)]
pub struct FailureTracker {
    config: BackoffConfig,
    failures: DashMap<String, u32>,
}

impl FailureTracker {
    /// Create a tracker with the given curve
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Count a failure for `key` and return the requeue delay
    pub fn record_failure(&self, key: &str) -> Duration {
        let attempt = {
            let mut entry = self.failures.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        self.config.delay_for(attempt)
    }

    /// Forget the failures of `key` after a successful reconcile
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Current consecutive failure count of `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|v| *v).unwrap_or(0)
    }
}
