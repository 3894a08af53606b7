//! Retry classification and exponential backoff for failed items.
//!
//! A failed attempt is classified from its `(stage, reason)` pair into a
//! [`FailureType`]:
//! - [`FailureType::Configuration`] - a precheck failed (e.g. required token missing)
//! - [`FailureType::NeedsAuth`] - the provider rejected the credentials (401/403)
//! - [`FailureType::Transient`] - anything else; may succeed on retry
//!
//! The [`RetryPolicy`] then decides whether to re-attempt, with a backoff
//! delay between attempts.
//!
//! # Example
//!
//! ```
//! use arrakis_core::download::{RetryDecision, RetryPolicy, classify_failure};
//!
//! let policy = RetryPolicy::default();
//! let failure = classify_failure("aria2c->wget", "wget_exit_4");
//!
//! match policy.should_retry(failure, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {reason}");
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::constants::MAX_ATTEMPTS;
use super::outcome::{reason, stage};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(32);
const MAX_JITTER_MS: u64 = 500;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: nonzero tool exit, stall timeout, resolve HTTP 5xx, connection reset.
    Transient,

    /// Deterministic configuration problem caught before any network activity.
    Configuration,

    /// The provider rejected the configured credentials.
    NeedsAuth,
}

impl FailureType {
    /// Whether another attempt could change the result.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Classifies a failed attempt by its stage and reason strings.
///
/// Pure function of its inputs so it can be tested without running any transport.
#[must_use]
pub fn classify_failure(failed_stage: &str, failure_reason: &str) -> FailureType {
    if failed_stage == stage::PRECHECK
        || failure_reason
            .to_ascii_lowercase()
            .contains(reason::TOKEN_REQUIRED_MARKER)
    {
        return FailureType::Configuration;
    }
    if failure_reason.contains(reason::AUTH_HTTP_401) || failure_reason.contains(reason::AUTH_HTTP_403) {
        return FailureType::NeedsAuth;
    }
    FailureType::Transient
}

/// Returns true if a failure with this stage and reason should be retried.
#[must_use]
pub fn is_retryable_failure(failed_stage: &str, failure_reason: &str) -> bool {
    classify_failure(failed_stage, failure_reason).is_retryable()
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then run attempt number `attempt`.
    Retry {
        /// Backoff before the next pass.
        delay: Duration,
        /// 1-indexed number of the upcoming attempt.
        attempt: u32,
    },

    /// Give up on the item.
    DoNotRetry {
        /// Why the item is not attempted again.
        reason: String,
    },
}

/// How many passes an item gets and how long to wait between them.
///
/// The wait before pass `n + 1` is `base * 2^(n - 1)`, capped, plus up to
/// 500ms of jitter. A zero base turns both backoff and jitter off.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// `max_attempts` passes (at least one) with the standard 1s..32s backoff.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base: BACKOFF_BASE,
            cap: BACKOFF_CAP,
        }
    }

    /// Same pass count, no waiting between passes.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts).with_backoff(Duration::ZERO, Duration::ZERO)
    }

    /// Overrides the first delay and the delay cap.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.base = base;
        self.cap = cap;
        self
    }

    /// Total passes per item, first one included.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what happens after pass `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        let refusal = match failure_type {
            FailureType::Configuration => Some("configuration error, retry would not help"),
            FailureType::NeedsAuth => Some("credentials rejected, retry would not help"),
            FailureType::Transient => None,
        };
        if let Some(reason) = refusal {
            return RetryDecision::DoNotRetry {
                reason: reason.to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, "no passes left");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.backoff(attempt);
        debug!(attempt, delay_ms = delay.as_millis(), "scheduling another pass");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let exponential = self.base.saturating_mul(factor).min(self.cap);
        exponential + jitter()
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS))
}
