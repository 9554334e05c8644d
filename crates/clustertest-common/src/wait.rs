//! The polling engine.
//!
//! Every wait in clustertest is a [`WaitCondition`] handed to [`poll`].
//! A condition performs exactly one check per call and answers:
//!
//! - `Ok(true)`: satisfied, polling stops with success
//! - `Ok(false)`: not yet, try again after the interval
//! - `Err(_)`: polling stops immediately and returns the error
//!
//! The first attempt runs immediately. The timeout covers the whole poll,
//! not a single attempt, and cancellation stops further attempts without
//! interrupting one in flight.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Default overall timeout for a poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default delay between attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Future returned by one condition check
pub type ConditionFuture = BoxFuture<'static, Result<bool>>;

type CheckFn = dyn Fn() -> ConditionFuture + Send + Sync;

/// A named, repeatable check
///
/// Cloning is cheap; clones share the same check function.
#[derive(Clone)]
pub struct WaitCondition {
    name: String,
    check: Arc<CheckFn>,
}

impl WaitCondition {
    /// Build a condition from a description and a check function
    ///
    /// The description appears in deadline errors, e.g.
    /// "Cluster org-acme/acme to be deleted".
    pub fn new<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(move || check().boxed()),
        }
    }

    /// Description of what this condition waits for
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a single check attempt
    pub fn check(&self) -> ConditionFuture {
        (self.check)()
    }

    /// Rename the condition, keeping its check
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl fmt::Debug for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCondition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Timeout, interval and cancellation for one [`poll`] call
#[derive(Clone, Debug)]
pub struct PollOptions {
    /// Overall time allowed for the condition to become true
    pub timeout: Duration,
    /// Delay between attempts
    pub interval: Duration,
    /// Cancels the poll between attempts
    pub cancel: CancellationToken,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_POLL_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }
}

impl PollOptions {
    /// Options with the given timeout and interval and a fresh cancellation token
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Tie the poll to a caller's cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Poll `condition` until it is satisfied, errors, times out or is cancelled.
///
/// At least one attempt is always made, even with a zero timeout. After an
/// unsatisfied attempt, if the next attempt would fall at or past the
/// deadline the poll waits out the remaining time and fails with
/// [`Error::DeadlineExceeded`].
pub async fn poll(condition: &WaitCondition, options: &PollOptions) -> Result<()> {
    let deadline = Instant::now() + options.timeout;
    let mut attempt = 0u32;

    loop {
        if options.cancel.is_cancelled() {
            debug!(condition = %condition.name(), attempt, "Poll cancelled");
            return Err(Error::deadline(condition.name(), options.timeout));
        }

        attempt += 1;
        if condition.check().await? {
            debug!(condition = %condition.name(), attempt, "Condition met");
            return Ok(());
        }
        trace!(condition = %condition.name(), attempt, "Condition not yet met");

        let now = Instant::now();
        let next = now + options.interval;
        let sleep_until = next.min(deadline);

        tokio::select! {
            _ = options.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(sleep_until) => {}
        }

        if next >= deadline || options.cancel.is_cancelled() {
            debug!(condition = %condition.name(), attempt, "Poll deadline exceeded");
            return Err(Error::deadline(condition.name(), options.timeout));
        }
    }
}

/// A condition satisfied only when every inner condition is satisfied.
///
/// Conditions are checked in order and the check stops at the first
/// unsatisfied or failing one.
pub fn all_of(name: impl Into<String>, conditions: Vec<WaitCondition>) -> WaitCondition {
    let conditions = Arc::new(conditions);
    WaitCondition::new(name, move || {
        let conditions = conditions.clone();
        async move {
            for condition in conditions.iter() {
                if !condition.check().await? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    })
}

/// A condition that must hold on `attempts` consecutive checks, `interval`
/// apart, within a single call.
///
/// Useful to assert that something stays true rather than becomes true.
pub fn consistently(inner: WaitCondition, attempts: u32, interval: Duration) -> WaitCondition {
    let name = format!("{} (consistently x{})", inner.name(), attempts);
    WaitCondition::new(name, move || {
        let inner = inner.clone();
        async move {
            for i in 0..attempts {
                if i > 0 {
                    tokio::time::sleep(interval).await;
                }
                if !inner.check().await? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Condition that becomes true on the `k`th call and counts calls
    fn true_after(k: u32) -> (WaitCondition, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let cond = WaitCondition::new("counter", move || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) + 1 >= k) }
        });
        (cond, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_is_immediate() {
        let (cond, calls) = true_after(1);
        let start = Instant::now();
        poll(&cond, &PollOptions::default()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_attempts_within_bounds() {
        let interval = Duration::from_secs(10);
        let (cond, calls) = true_after(4);
        let start = Instant::now();

        poll(&cond, &PollOptions::new(Duration::from_secs(600), interval))
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(elapsed >= interval * 3);
        assert!(elapsed < interval * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_shorter_than_interval_makes_one_attempt() {
        let (cond, calls) = true_after(u32::MAX);
        let err = poll(
            &cond,
            &PollOptions::new(Duration::from_secs(1), Duration::from_secs(10)),
        )
        .await
        .unwrap_err();

        assert!(err.is_deadline_exceeded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_still_attempts_once() {
        let (cond, calls) = true_after(1);
        poll(&cond, &PollOptions::new(Duration::ZERO, Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_aborts_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let cond = WaitCondition::new("failing", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::internal("boom"))
            }
        });

        let err = poll(&cond, &PollOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_further_attempts() {
        let (cond, calls) = true_after(u32::MAX);
        let options = PollOptions::default();
        let cancel = options.cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            cancel.cancel();
        });

        let err = poll(&cond, &options).await.unwrap_err();
        assert!(err.is_deadline_exceeded());
        // attempts at 0s, 10s, 20s; cancelled at 25s
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_makes_no_attempt() {
        let (cond, calls) = true_after(1);
        let options = PollOptions::default();
        options.cancel.cancel();

        assert!(poll(&cond, &options).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_error_names_condition() {
        let cond = WaitCondition::new("Namespace org-acme to exist", || async { Ok(false) });
        let err = poll(
            &cond,
            &PollOptions::new(Duration::from_secs(5), Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Namespace org-acme to exist"));
    }

    #[tokio::test]
    async fn test_all_of_short_circuits() {
        let (second, second_calls) = true_after(1);
        let first = WaitCondition::new("never", || async { Ok(false) });
        let both = all_of("both", vec![first, second]);

        assert!(!both.check().await.unwrap());
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consistently_requires_every_check() {
        let (flaky, calls) = true_after(3);
        let stable = consistently(flaky, 3, Duration::from_secs(1));
        assert!(!stable.check().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (always, calls) = true_after(1);
        let stable = consistently(always, 3, Duration::from_secs(1));
        assert!(stable.check().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
