//! Bounded retry policy for failed flushes.

use serde::Deserialize;
use std::time::Duration;

use crate::db::StoreError;

/// Exponential backoff with a cap and an attempt budget.
///
/// Only transient store errors are retried automatically. The budget is
/// reset by any natural trigger (new edit, explicit flush, reconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Automatic retries after the first failure; 0 disables them
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 500,
      max_delay_ms: 30_000,
    }
  }
}

impl RetryPolicy {
  pub fn disabled() -> Self {
    Self {
      max_attempts: 0,
      ..Self::default()
    }
  }

  /// Delay before automatic retry number `attempt` (1-based) after `error`,
  /// or `None` if no automatic retry should happen.
  pub fn next_delay(&self, attempt: u32, error: &StoreError) -> Option<Duration> {
    if !error.is_transient() || attempt == 0 || attempt > self.max_attempts {
      return None;
    }
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
    Some(Duration::from_millis(delay))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn transient() -> StoreError {
    StoreError::Unavailable("timeout".into())
  }

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
      max_attempts: 10,
      base_delay_ms: 500,
      max_delay_ms: 3_000,
    };
    let delays: Vec<u64> = (1..=5)
      .map(|n| policy.next_delay(n, &transient()).unwrap().as_millis() as u64)
      .collect();
    assert_eq!(delays, vec![500, 1_000, 2_000, 3_000, 3_000]);
  }

  #[test]
  fn test_budget_is_bounded() {
    let policy = RetryPolicy::default();
    assert!(policy.next_delay(3, &transient()).is_some());
    assert!(policy.next_delay(4, &transient()).is_none());
    assert!(RetryPolicy::disabled().next_delay(1, &transient()).is_none());
  }

  #[test]
  fn test_permanent_errors_are_not_retried() {
    let policy = RetryPolicy::default();
    let rejected = StoreError::Rejected("bad config".into());
    assert!(policy.next_delay(1, &rejected).is_none());
  }

  #[test]
  fn test_huge_attempt_does_not_overflow() {
    let policy = RetryPolicy {
      max_attempts: u32::MAX,
      base_delay_ms: 1_000,
      max_delay_ms: 60_000,
    };
    assert_eq!(
      policy.next_delay(200, &transient()),
      Some(Duration::from_millis(60_000))
    );
  }
}
