/// Automatic retry policy
///
/// Exponential backoff with a cap: the delay after the n-th failed attempt is
/// `min(2^n, cap)` seconds. The same policy applies in poll and beat mode.

use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// max_retries stamped on new tasks
    pub max_retries: u32,
    /// Upper bound on the delay between attempts
    pub backoff_cap_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_cap_secs: 300,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts have run
    pub fn backoff(&self, tries: u32) -> Duration {
        let secs = 1u64
            .checked_shl(tries)
            .unwrap_or(u64::MAX)
            .min(self.backoff_cap_secs)
            .min(i64::MAX as u64);
        Duration::seconds(secs as i64)
    }
}
