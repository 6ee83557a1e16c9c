//! Backoff between retries of transient failures.
//!
//! Both sides of the pipeline retry infrastructure errors forever: the relay at
//! its tick cadence, topic workers with a [`BackoffPolicy`]. The default policy
//! is a fixed delay; a multiplier and cap turn it into exponential backoff.
//!
//! # Example
//!
//! ```rust
//! use outbox_relay_runtime::backoff::{BackoffPolicy, retry_until_ok};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = BackoffPolicy::builder()
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let (value, attempts) = retry_until_ok(&policy, || async {
//!     // Your fallible operation here
//!     Ok::<_, String>(42)
//! }, |_err, _attempt| {}).await;
//! assert_eq!((value, attempts), (42, 1));
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Delay schedule between retries.
///
/// # Default Values
///
/// - `initial_delay`: 1 second
/// - `max_delay`: 1 second
/// - `multiplier`: 1.0 (fixed backoff)
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt; `1.0` means fixed backoff
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl BackoffPolicy {
    /// Fixed backoff: every retry waits `delay`.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Calculate delay for a given attempt number (0-based).
    ///
    /// delay = `initial_delay` * (multiplier ^ attempt), capped at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 || self.multiplier <= 1.0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap_ms = self.max_delay.as_millis() as f64;

        if !delay_ms.is_finite() || delay_ms >= cap_ms {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl BackoffPolicyBuilder {
    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`BackoffPolicy`].
    ///
    /// Without an explicit cap, `max_delay` equals `initial_delay` unless a
    /// multiplier was set, in which case it defaults to 30 seconds.
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        let initial_delay = self.initial_delay.unwrap_or(Duration::from_secs(1));
        let multiplier = self.multiplier.unwrap_or(1.0);
        let default_cap = if multiplier > 1.0 {
            Duration::from_secs(30).max(initial_delay)
        } else {
            initial_delay
        };
        BackoffPolicy {
            initial_delay,
            max_delay: self.max_delay.unwrap_or(default_cap),
            multiplier,
        }
    }
}

/// Run `operation` until it succeeds, sleeping per `policy` between attempts.
///
/// `on_error` sees every failure together with its 1-based attempt number,
/// before the backoff sleep. Returns the value and the number of attempts made.
///
/// There is no attempt limit; callers bound the total time from outside
/// (e.g. by aborting the task).
pub async fn retry_until_ok<F, Fut, T, E, L>(
    policy: &BackoffPolicy,
    mut operation: F,
    mut on_error: L,
) -> (T, usize)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    L: FnMut(&E, usize),
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return (value, attempt),
            Err(err) => {
                on_error(&err, attempt);
                sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}
