//! Retry policy: retriability classification and delay computation
//! (spec.md §4.10).
//!
//! The caller re-enters the entire admission/encode/write/await pipeline on
//! each attempt; this module only classifies errors and computes delays.

use std::time::Duration;

use crate::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffMode {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub mode: BackoffMode,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            mode: BackoffMode::Exponential,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Retriable transport-level substrings (spec.md §4.10).
const RETRIABLE_NEEDLES: &[&str] = &[
    "Connection refused",
    "Connection reset",
    "No route to host",
];

pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Connect failures, timeouts, and transport errors matching the
    /// well-known substrings are retriable; business errors never are
    /// (spec.md §4.10, §7).
    pub fn is_retriable(&self, error: &RpcError) -> bool {
        match error {
            RpcError::ConnectTimeout | RpcError::RequestTimeout => true,
            RpcError::TransportError(msg) => RETRIABLE_NEEDLES.iter().any(|n| msg.contains(n)),
            RpcError::CircuitOpen(_) => true,
            _ => false,
        }
    }

    pub fn should_retry(&self, attempt: u32, error: &RpcError) -> bool {
        attempt < self.config.max_retries && self.is_retriable(error)
    }

    /// Delay before `attempt` (0-indexed: the delay awaited before the
    /// *next* try after `attempt` has failed) (spec.md §4.10).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        match self.config.mode {
            BackoffMode::Fixed => self.config.base_delay,
            BackoffMode::Exponential => {
                let factor = self.config.multiplier.powi(attempt as i32);
                let millis = (self.config.base_delay.as_millis() as f64 * factor) as u64;
                Duration::from_millis(millis).min(self.config.max_delay)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_request_timeouts_are_retriable() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retriable(&RpcError::ConnectTimeout));
        assert!(policy.is_retriable(&RpcError::RequestTimeout));
    }

    #[test]
    fn transport_errors_match_well_known_substrings_only() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retriable(&RpcError::TransportError(
            "Connection refused by peer".into()
        )));
        assert!(!policy.is_retriable(&RpcError::TransportError("disk full".into())));
    }

    #[test]
    fn business_errors_are_never_retriable() {
        let policy = RetryPolicy::default();
        let err = RpcError::BusinessError {
            code: "VALIDATION".into(),
            message: "bad input".into(),
        };
        assert!(!policy.is_retriable(&err));
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 2,
            ..RetryConfig::default()
        });
        assert!(policy.should_retry(0, &RpcError::ConnectTimeout));
        assert!(policy.should_retry(1, &RpcError::ConnectTimeout));
        assert!(!policy.should_retry(2, &RpcError::ConnectTimeout));
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            mode: BackoffMode::Exponential,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(300),
            ..RetryConfig::default()
        });
        assert_eq!(policy.retry_delay(0), Duration::from_millis(100));
        assert_eq!(policy.retry_delay(1), Duration::from_millis(200));
        assert_eq!(policy.retry_delay(2), Duration::from_millis(300));
        assert_eq!(policy.retry_delay(5), Duration::from_millis(300));
    }

    #[test]
    fn fixed_backoff_never_changes() {
        let policy = RetryPolicy::new(RetryConfig {
            mode: BackoffMode::Fixed,
            base_delay: Duration::from_millis(250),
            ..RetryConfig::default()
        });
        assert_eq!(policy.retry_delay(0), Duration::from_millis(250));
        assert_eq!(policy.retry_delay(4), Duration::from_millis(250));
    }
}
