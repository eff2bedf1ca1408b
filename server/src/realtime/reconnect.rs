//! Reconnection backoff strategies
//!
//! Delay for attempt `n` (1-based):
//! - exponential: `min(base * mult^(n-1), max)`
//! - linear: `base + base * (n-1)`, capped at max
//! - fixed: `base`
//! - adaptive: exponential scaled by system load (connection count steps)
//!   and fleet-wide quality (average quality weight, capped at 3.0)
//!
//! Jitter, when enabled, spreads the delay over
//! `[delay * (1-J), delay * (1+J)]` with a 100ms floor.

use rand::Rng;

use crate::core::config::{ReconnectStrategy, RetryConfig};
use crate::core::constants::MIN_RECONNECT_DELAY_MS;

/// Fleet-wide inputs for the adaptive strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSnapshot {
    pub total_connections: usize,
    /// Mean quality weight over all connections (EXCELLENT=1.0 .. CRITICAL=2.0)
    pub average_quality_weight: f64,
}

/// Computes reconnection delays from the retry configuration
#[derive(Clone)]
pub struct ReconnectPolicy {
    config: RetryConfig,
}

impl ReconnectPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the given attempt, ignoring jitter
    pub fn base_delay(&self, attempt: u32, system: &SystemSnapshot) -> u64 {
        let attempt = attempt.max(1);
        let base = self.config.initial_delay_ms as f64;
        let exponential = base
            * self
                .config
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(64) as i32);

        let delay = match self.config.strategy {
            ReconnectStrategy::Exponential => exponential,
            ReconnectStrategy::Linear => base + base * (attempt - 1) as f64,
            ReconnectStrategy::Fixed => base,
            ReconnectStrategy::Adaptive => {
                exponential * load_factor(system.total_connections)
                    * quality_factor(system.average_quality_weight)
            }
        };

        (delay as u64).min(self.config.max_delay_ms)
    }

    /// Delay before the given attempt, with jitter applied when enabled
    pub fn delay(&self, attempt: u32, system: &SystemSnapshot) -> u64 {
        let base = self.base_delay(attempt, system);
        if !self.config.jitter {
            return base.max(MIN_RECONNECT_DELAY_MS);
        }
        let j = self.config.jitter_factor;
        let factor = 1.0 - j + rand::thread_rng().r#gen::<f64>() * 2.0 * j;
        ((base as f64 * factor) as u64).max(MIN_RECONNECT_DELAY_MS)
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn reset_after_ms(&self) -> u64 {
        self.config.reset_after_ms
    }
}

fn load_factor(total_connections: usize) -> f64 {
    match total_connections {
        n if n > 1_000 => 2.0,
        n if n > 500 => 1.5,
        n if n > 100 => 1.2,
        _ => 1.0,
    }
}

fn quality_factor(average_weight: f64) -> f64 {
    average_weight.max(1.0).min(3.0)
}
