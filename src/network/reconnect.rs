//! Reconnection policy
//!
//! One policy object shared by every path that retries a peer: outbound
//! connect failures, send failures and inbound disconnects.

use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffKind, NetworkConfig};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_JITTER_PERCENT: u32 = 20;
const MAX_JITTER_PERCENT: u32 = 100;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every attempt
    Fixed,
    /// Doubles every attempt up to `max_delay`
    Exponential {
        /// Ceiling for the delay
        max_delay: Duration,
    },
}

/// Bounded retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Growth strategy
    pub backoff: Backoff,
    /// Random extra delay, as a percentage of each scheduled delay
    pub jitter_percent: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            backoff: Backoff::Fixed,
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }
}

impl ReconnectPolicy {
    /// Creates a fixed-delay policy
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            backoff: Backoff::Fixed,
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }

    /// Creates a capped exponential policy
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Exponential { max_delay },
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }

    /// Sets the jitter percentage, capped at 100
    pub fn with_jitter(mut self, percent: u32) -> Self {
        self.jitter_percent = percent.min(MAX_JITTER_PERCENT);
        self
    }

    /// Builds the policy from network configuration
    pub fn from_config(config: &NetworkConfig) -> Self {
        let base_delay = Duration::from_secs(config.reconnect_delay_secs);
        match config.backoff {
            BackoffKind::Fixed => Self::fixed(config.max_reconnect_attempts, base_delay),
            BackoffKind::Exponential => Self::exponential(
                config.max_reconnect_attempts,
                base_delay,
                Duration::from_secs(config.max_reconnect_delay_secs),
            ),
        }
    }

    /// Delay before the given attempt (1-based), or None once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        match self.backoff {
            Backoff::Fixed => Some(self.base_delay),
            Backoff::Exponential { max_delay } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                let delay = self
                    .base_delay
                    .checked_mul(factor)
                    .unwrap_or(max_delay);
                Some(delay.min(max_delay))
            }
        }
    }

    /// Adds up to `jitter_percent` of random extra delay
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_percent == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter_percent);
        delay + delay * extra / 100
    }

    /// Iterates the full schedule
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).filter_map(move |attempt| self.delay_for(attempt))
    }
}
