//! Retry policy for transient rig faults.
//!
//! Retries are bounded and local to a single grid point. The policy only says
//! how many re-issues are allowed and how long to back off between them; the
//! decision whether a fault is transient lives on [`FaultKind`].
//!
//! [`FaultKind`]: crate::error::FaultKind

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::HardwareError;

/// Defines a policy for retrying a grid point.
///
/// # Example
///
/// ```rust
/// use sonorover::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_retries: 2,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.max_attempts(), 3);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of re-issues after the initial attempt. 0 disables retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Constant delay before each re-issue.
    #[serde(default, with = "humantime_serde")]
    pub backoff_delay: Duration,
}

fn default_max_retries() -> u32 {
    1
}

impl Default for RetryPolicy {
    /// One retry, no backoff.
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_delay: Duration::ZERO,
        }
    }

    /// Total attempts a point may receive, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether `error` may be retried given `retries_used` re-issues so far.
    pub fn allows(&self, error: &HardwareError, retries_used: u32) -> bool {
        error.is_retryable() && retries_used < self.max_retries
    }

    /// Sleep for the configured backoff, if any.
    pub async fn backoff(&self) {
        if !self.backoff_delay.is_zero() {
            tokio::time::sleep(self.backoff_delay).await;
        }
    }
}
