//! Ledger configuration and the allocation retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use stockledger_inventory::DEFAULT_EXPIRY_THRESHOLD_DAYS;

pub const ENV_EXPIRY_THRESHOLD_DAYS: &str = "STOCKLEDGER_EXPIRY_THRESHOLD_DAYS";
pub const ENV_ALLOW_NEGATIVE_STOCK: &str = "STOCKLEDGER_ALLOW_NEGATIVE_STOCK";
pub const ENV_ALLOCATION_MAX_ATTEMPTS: &str = "STOCKLEDGER_ALLOCATION_MAX_ATTEMPTS";
pub const ENV_ALLOCATION_BASE_DELAY_MS: &str = "STOCKLEDGER_ALLOCATION_BASE_DELAY_MS";

/// Backoff strategy between allocation attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How often a conflicted allocation is re-planned and how long to wait in
/// between.
///
/// `max_attempts` counts every try, the first one included; `1` disables
/// retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Give up on the first conflict.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` tries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Runtime knobs for the ledger services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Window for `expiring_soon` alerts.
    pub expiry_threshold_days: u32,
    /// Let location quantities go below zero instead of failing with
    /// `InsufficientStock`.
    pub allow_negative_stock: bool,
    pub allocation_retry: RetryPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            expiry_threshold_days: DEFAULT_EXPIRY_THRESHOLD_DAYS,
            allow_negative_stock: false,
            allocation_retry: RetryPolicy::default(),
        }
    }
}

impl LedgerConfig {
    /// Defaults overridden by `STOCKLEDGER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`LedgerConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(days) = parsed(&lookup, ENV_EXPIRY_THRESHOLD_DAYS, parse_u32) {
            config.expiry_threshold_days = days;
        }
        if let Some(allow) = parsed(&lookup, ENV_ALLOW_NEGATIVE_STOCK, parse_bool) {
            config.allow_negative_stock = allow;
        }
        if let Some(attempts) = parsed(&lookup, ENV_ALLOCATION_MAX_ATTEMPTS, parse_u32) {
            if attempts == 0 {
                warn!(
                    key = ENV_ALLOCATION_MAX_ATTEMPTS,
                    "max attempts must be at least 1, keeping default"
                );
            } else {
                config.allocation_retry.max_attempts = attempts;
            }
        }
        if let Some(ms) = parsed(&lookup, ENV_ALLOCATION_BASE_DELAY_MS, |v| {
            v.parse::<u64>().ok()
        }) {
            config.allocation_retry.base_delay = Duration::from_millis(ms);
            config.allocation_retry.max_delay = config.allocation_retry.max_delay.max(
                Duration::from_millis(ms),
            );
        }

        config
    }

    pub fn with_expiry_threshold_days(mut self, days: u32) -> Self {
        self.expiry_threshold_days = days;
        self
    }

    pub fn with_negative_stock(mut self, allow: bool) -> Self {
        self.allow_negative_stock = allow;
        self
    }

    pub fn with_allocation_retry(mut self, policy: RetryPolicy) -> Self {
        self.allocation_retry = policy;
        self
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let value = parse(raw.trim());
    if value.is_none() {
        warn!(key, value = %raw, "ignoring invalid configuration value");
    }
    value
}

fn parse_u32(v: &str) -> Option<u32> {
    v.parse().ok()
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
