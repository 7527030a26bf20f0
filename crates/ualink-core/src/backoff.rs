// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Reconnect backoff policies.
//!
//! Session recovery (reactivation falling back to recreation) retries on a
//! schedule chosen by a [`ReconnectPolicy`]. The policy is only asked for the
//! delay before the next attempt; the caller owns the timer.
//!
//! # Built-in Policies
//!
//! - [`NoRetry`]: give up after the first failure
//! - [`FixedDelay`]: constant delay
//! - [`ExponentialBackoff`]: `initial * multiplier^(attempt-1)`, capped at `max_delay`
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use ualink_core::backoff::{BackoffConfig, ExponentialBackoff, ReconnectPolicy, RetryDecision};
//!
//! let policy = ExponentialBackoff::new(BackoffConfig::default());
//! assert_eq!(policy.next_delay(1), RetryDecision::Retry(Duration::from_secs(1)));
//! assert_eq!(policy.next_delay(2), RetryDecision::Retry(Duration::from_secs(2)));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Configuration
// =============================================================================

/// Which policy [`BackoffConfig::build`] produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Exponentially increasing delay.
    #[default]
    Exponential,
    /// Constant delay.
    Fixed,
    /// No retries.
    None,
}

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Policy kind.
    #[serde(default)]
    pub kind: BackoffKind,

    /// Maximum attempts before giving up. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Delay before the first retry.
    #[serde(default = "default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor in `0.0..=1.0`.
    #[serde(default)]
    pub jitter: f64,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(16)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::default(),
            max_attempts: None,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            kind: BackoffKind::None,
            ..Default::default()
        }
    }

    /// Fixed delay configuration.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial_delay: delay,
            max_delay: delay,
            ..Default::default()
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter factor.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> CoreResult<()> {
        if self.multiplier < 1.0 {
            return Err(CoreError::invalid_backoff("multiplier must be >= 1.0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(CoreError::invalid_backoff(
                "max_delay must not be shorter than initial_delay",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CoreError::invalid_backoff("jitter must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Builds the configured policy.
    pub fn build(&self) -> Arc<dyn ReconnectPolicy> {
        match self.kind {
            BackoffKind::Exponential => Arc::new(ExponentialBackoff::new(self.clone())),
            BackoffKind::Fixed => Arc::new(FixedDelay::new(self.clone())),
            BackoffKind::None => Arc::new(NoRetry),
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempt > max)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// =============================================================================
// Policy Trait
// =============================================================================

/// Decision returned by a [`ReconnectPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Stop retrying.
    GiveUp,
}

/// Chooses the delay before a recovery attempt.
pub trait ReconnectPolicy: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Delay before attempt number `attempt` (1-based).
    fn next_delay(&self, attempt: u32) -> RetryDecision;
}

// =============================================================================
// Policies
// =============================================================================

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl ReconnectPolicy for NoRetry {
    fn name(&self) -> &str {
        "no_retry"
    }

    fn next_delay(&self, _attempt: u32) -> RetryDecision {
        RetryDecision::GiveUp
    }
}

/// Waits the same delay before every attempt.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    config: BackoffConfig,
}

impl FixedDelay {
    /// Creates a fixed delay policy.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }
}

impl ReconnectPolicy for FixedDelay {
    fn name(&self) -> &str {
        "fixed_delay"
    }

    fn next_delay(&self, attempt: u32) -> RetryDecision {
        if self.config.exhausted(attempt) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(apply_jitter(self.config.initial_delay, self.config.jitter))
    }
}

/// Exponentially increasing delay.
///
/// Delay formula: `min(initial_delay * multiplier^(attempt-1), max_delay)`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    /// Creates an exponential backoff policy.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let multiplied = base * self.config.multiplier.powi(exponent);
        let capped = multiplied.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn name(&self) -> &str {
        "exponential_backoff"
    }

    fn next_delay(&self, attempt: u32) -> RetryDecision {
        if self.config.exhausted(attempt) {
            return RetryDecision::GiveUp;
        }
        let delay = self.calculate_delay(attempt);
        RetryDecision::Retry(apply_jitter(delay, self.config.jitter))
    }
}

fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let millis = duration.as_millis() as f64;
    let spread = millis * jitter_factor;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((millis + offset).max(0.0) as u64)
}

// =============================================================================
// Tests
// =============================================================================
