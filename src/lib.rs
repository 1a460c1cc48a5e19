// Copyright 2026 The Stratum Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! # Write Controller
//!
//! Admission control for a log-structured key-value storage engine: the single mechanism
//! through which background pressure (full memtables, too many level-0 files, pending
//! compaction bytes) is communicated back to foreground writers.
//!
//! ## Behavior
//!
//! The controller starts off unstopped and undelayed. Stress-signal producers (compaction,
//! flush, and friends) mint [`StopToken`]s and [`DelayToken`]s when they want writers to stop
//! or slow down, and drop them when the stress they represent subsides. While any stop token is
//! outstanding, [`Controller::is_stopped`] reports `true` and callers are expected not to issue
//! writes at all. While no stop token is outstanding but at least one delay token is,
//! [`Controller::get_delay`] hands back a sleep duration computed by an internal token bucket so
//! that aggregate write throughput converges on the most recently minted delay token's rate.
//!
//! Minting a new delay token always resets the bucket (see [`bucket`]): a surplus accumulated at
//! a fast rate is not spent instantly at a newly-lowered one, and vice versa.
//!
//! ## Limitations
//!
//! The controller does not arbitrate fairness between writers, does not persist its vote state
//! across a process restart, and does not coordinate across engine instances - one controller
//! belongs to exactly one storage engine.
//!
//! Another particularity of this crate is that it never sleeps on a caller's behalf: it hands
//! back a duration and the caller decides how (and whether) to wait it out, which keeps the
//! controller off the critical path for both tests and callers that want to cancel a wait on
//! shutdown.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;

use bucket::Bucket;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::WriteControllerConfig;
pub use error::WriteControllerError;
pub use metrics::WriteControllerMetrics;

/// Bucket state guarded by a single lock: the active rate and the balance it was measured
/// against must never be observed out of sync with each other.
struct BucketState {
    bucket: Bucket,
    current_delay_rate_bytes_per_sec: u64,
}

/// Shared state behind every [`Controller`] handle and every token minted from it.
///
/// Tokens hold an `Arc` to this directly rather than a back-reference to the `Controller` they
/// came from, so the controller and its tokens share ownership symmetrically: whichever handle
/// is dropped last is the one that frees `Inner`, and "the controller outlives its tokens" is
/// true by construction instead of a documented caller obligation.
struct Inner {
    configured_rate_bytes_per_sec: u64,
    stop_vote_count: AtomicI64,
    delay_vote_count: AtomicI64,
    bucket_state: Mutex<BucketState>,
    metrics: WriteControllerMetrics,
}

/// The admission-control root object: mints votes, answers `is_stopped`/`is_delayed`, and turns
/// byte counts into sleep durations.
///
/// `Controller` is a cheap, `Clone`-able handle around a shared `Inner` (see [`Inner`]); cloning
/// it does not create a second controller, it creates a second reference to the same vote state
/// and bucket.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("configured_rate_bytes_per_sec", &self.inner.configured_rate_bytes_per_sec)
            .field("stop_vote_count", &self.inner.stop_vote_count.load(Ordering::Relaxed))
            .field("delay_vote_count", &self.inner.delay_vote_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Controller {
    /// Creates a new controller with `configured_rate_bytes_per_sec` as its default delay rate.
    ///
    /// A rate of `0` is permitted here (it only disables [`Controller::delayed_write_rate`]'s
    /// convenience value); it is [`Controller::new_delay_token`] that rejects non-positive rates,
    /// since that is the path that actually arms the bucket.
    pub fn new(configured_rate_bytes_per_sec: u64) -> Self {
        let metrics = WriteControllerMetrics::new()
            .expect("write controller metric descriptors are static and always valid");
        metrics
            .current_delay_rate_bytes_per_sec
            .set(0);
        Controller {
            inner: Arc::new(Inner {
                configured_rate_bytes_per_sec,
                stop_vote_count: AtomicI64::new(0),
                delay_vote_count: AtomicI64::new(0),
                bucket_state: Mutex::new(BucketState {
                    bucket: Bucket::new(),
                    current_delay_rate_bytes_per_sec: 0,
                }),
                metrics,
            }),
        }
    }

    /// Mints a new stop vote. Never fails: stopping has no precondition.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn new_stop_token(&self) -> StopToken {
        let previous = self.inner.stop_vote_count.fetch_add(1, Ordering::SeqCst);
        self.inner
            .metrics
            .stop_votes
            .set(self.inner.stop_vote_count.load(Ordering::SeqCst));
        if previous == 0 {
            tracing::debug!("write controller stopped: first stop vote minted");
        }
        StopToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Mints a new delay vote at `rate_bytes_per_sec`, panicking if the rate is not positive.
    ///
    /// This is the public, total-looking convenience described in the external interface; it is
    /// a thin wrapper over [`Controller::try_new_delay_token`], which gives the one validated
    /// precondition a typed `Result` instead of an ad-hoc `assert!`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn new_delay_token(&self, rate_bytes_per_sec: u64) -> DelayToken {
        self.try_new_delay_token(rate_bytes_per_sec)
            .unwrap_or_else(|err| panic!("new_delay_token: {err}"))
    }

    /// Fallible form of [`Controller::new_delay_token`].
    ///
    /// Returns [`WriteControllerError::NonPositiveRate`] instead of panicking when
    /// `rate_bytes_per_sec` is `0`, so the precondition has a testable shape.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn try_new_delay_token(
        &self,
        rate_bytes_per_sec: u64,
    ) -> Result<DelayToken, WriteControllerError> {
        if rate_bytes_per_sec == 0 {
            return Err(WriteControllerError::NonPositiveRate(rate_bytes_per_sec));
        }

        {
            let mut state = self.inner.bucket_state.lock();
            state.bucket.reset();
            state.current_delay_rate_bytes_per_sec = rate_bytes_per_sec;
        }
        self.inner
            .metrics
            .current_delay_rate_bytes_per_sec
            .set(rate_bytes_per_sec as i64);
        self.inner.metrics.bucket_resets_total.inc();

        let previous = self.inner.delay_vote_count.fetch_add(1, Ordering::SeqCst);
        self.inner
            .metrics
            .delay_votes
            .set(self.inner.delay_vote_count.load(Ordering::SeqCst));
        tracing::debug!(rate_bytes_per_sec, "write controller delay rate changed, bucket reset");

        Ok(DelayToken {
            inner: Arc::clone(&self.inner),
        })
    }

    /// `true` while at least one [`StopToken`] minted from this controller is alive.
    pub fn is_stopped(&self) -> bool {
        self.inner.stop_vote_count.load(Ordering::SeqCst) > 0
    }

    /// `true` while at least one [`DelayToken`] minted from this controller is alive.
    pub fn is_delayed(&self) -> bool {
        self.inner.delay_vote_count.load(Ordering::SeqCst) > 0
    }

    /// The rate this controller was constructed with, for callers that want to vote "at the
    /// default rate" via `new_delay_token(controller.delayed_write_rate())`.
    ///
    /// This is the configured default, not the rate currently in effect; use
    /// [`Controller::current_delay_rate_bytes_per_sec`] for the latter.
    pub fn delayed_write_rate(&self) -> u64 {
        self.inner.configured_rate_bytes_per_sec
    }

    /// The delay rate currently in effect, or `0` if no delay vote is outstanding.
    pub fn current_delay_rate_bytes_per_sec(&self) -> u64 {
        self.inner.bucket_state.lock().current_delay_rate_bytes_per_sec
    }

    /// The collectors this controller's host should register into its own metrics registry.
    pub fn metrics(&self) -> &WriteControllerMetrics {
        &self.inner.metrics
    }

    /// Computes how many microseconds the caller must sleep before issuing `num_bytes` of
    /// writes, given the currently active delay rate and `clock`'s notion of the current time.
    ///
    /// Returns `0` immediately, without locking the bucket or reading `clock`, if no delay vote
    /// is outstanding. The caller is expected to have already checked [`Controller::is_stopped`]
    /// separately; this method's result is meaningless while stopped.
    #[tracing::instrument(level = "trace", skip(self, clock))]
    pub fn get_delay(&self, clock: &dyn Clock, num_bytes: u64) -> u64 {
        if !self.is_delayed() {
            return 0;
        }

        let mut state = self.inner.bucket_state.lock();
        let rate = state.current_delay_rate_bytes_per_sec;
        let delay_us = state.bucket.get_delay(clock, num_bytes, rate);
        drop(state);

        self.inner
            .metrics
            .get_delay_wait_duration_us
            .observe(delay_us as f64);
        if delay_us >= bucket::MAX_SLEEP_US {
            self.inner.metrics.clamped_sleeps_total.inc();
            tracing::warn!(num_bytes, delay_us, "get_delay clamped to maximum sleep");
        }
        delay_us
    }
}

/// A handle representing one outstanding stop vote.
///
/// While alive, it holds [`Controller::is_stopped`] (for this token's controller) at `true`.
/// Dropping it releases the vote; once the last outstanding [`StopToken`] for a controller is
/// dropped, that controller's `is_stopped` reports `false` again (unless another stop token is
/// still outstanding).
pub struct StopToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken").finish_non_exhaustive()
    }
}

impl Drop for StopToken {
    fn drop(&mut self) {
        let previous = self.inner.stop_vote_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "stop_vote_count underflow on StopToken drop");
        self.inner
            .metrics
            .stop_votes
            .set(self.inner.stop_vote_count.load(Ordering::SeqCst).max(0));
        if previous == 1 {
            tracing::debug!("write controller unstopped: last stop vote dropped");
        }
    }
}

/// A handle representing one outstanding delay vote at a specific rate.
///
/// Minting one (via [`Controller::new_delay_token`] / [`Controller::try_new_delay_token`]) makes
/// its rate the one in effect and resets the bucket; dropping it only decrements the delay vote
/// count; it does not revert the active rate to whatever an earlier, still-live token asked for
/// (see §4.1 of the design: the most *recently minted* delay token dictates the rate).
pub struct DelayToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for DelayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayToken").finish_non_exhaustive()
    }
}

impl Drop for DelayToken {
    fn drop(&mut self) {
        let previous = self.inner.delay_vote_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "delay_vote_count underflow on DelayToken drop");
        self.inner
            .metrics
            .delay_votes
            .set(self.inner.delay_vote_count.load(Ordering::SeqCst).max(0));
        if previous == 1 {
            self.inner.bucket_state.lock().current_delay_rate_bytes_per_sec = 0;
            self.inner.metrics.current_delay_rate_bytes_per_sec.set(0);
            tracing::debug!("write controller undelayed: last delay vote dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_controller_is_normal() {
        let controller = Controller::new(10_000_000);
        assert!(!controller.is_stopped());
        assert!(!controller.is_delayed());
        assert_eq!(controller.delayed_write_rate(), 10_000_000);
        assert_eq!(controller.current_delay_rate_bytes_per_sec(), 0);
    }

    #[test]
    fn s2_stop_composition() {
        let controller = Controller::new(10_000_000);
        let a = controller.new_stop_token();
        let b = controller.new_stop_token();
        assert!(controller.is_stopped());
        drop(a);
        assert!(controller.is_stopped());
        drop(b);
        assert!(!controller.is_stopped());
    }

    #[test]
    fn stopped_and_delayed_are_independent() {
        let controller = Controller::new(10_000_000);
        let delay = controller.new_delay_token(10_000_000);
        let stop = controller.new_stop_token();
        assert!(controller.is_stopped());
        assert!(controller.is_delayed());
        drop(stop);
        assert!(!controller.is_stopped());
        assert!(controller.is_delayed());
        drop(delay);
        assert!(!controller.is_delayed());
    }

    #[test]
    fn s1_changing_the_delay_rate() {
        let controller = Controller::new(10_000_000);
        let clock = ManualClock::new(6666);

        let t1 = controller.new_delay_token(10_000_000);
        assert_eq!(controller.get_delay(&clock, 20_000_000), 2_000_000);
        drop(t1);

        // A rate change resets the bucket, so the next call sees full debt for 20_000_000
        // bytes at the new rate, clamped to MAX_SLEEP_US per the resolved open question (§8.1).
        let t2 = controller.new_delay_token(2_000_000);
        assert_eq!(controller.get_delay(&clock, 20_000_000), bucket::MAX_SLEEP_US);
        drop(t2);

        let t3 = controller.new_delay_token(1_000_000);
        assert_eq!(controller.get_delay(&clock, 20_000_000), bucket::MAX_SLEEP_US);
        drop(t3);

        let t4 = controller.new_delay_token(20_000_000);
        assert_eq!(controller.get_delay(&clock, 20_000_000), 1_000_000);
        drop(t4);

        let t5 = controller.new_delay_token(40_000_000);
        assert_eq!(controller.get_delay(&clock, 20_000_000), 500_000);
        drop(t5);
    }

    #[test]
    fn s3_new_token_resets_debt_from_a_prior_token() {
        // Mirrors bucket::tests::debt_is_paid_down_by_refills_across_calls, but driven through
        // the controller so the reset is caused by minting a second DelayToken rather than by
        // calling Bucket::reset directly.
        let controller = Controller::new(10_000_000);
        let clock = ManualClock::new(0);

        let first = controller.new_delay_token(10_000_000);
        assert_eq!(controller.get_delay(&clock, 20_000_000), 2_000_000);
        clock.advance(1_999_900);

        // A second delay token at the same rate still resets the bucket (§3 invariant 6):
        // the 1_000-byte debt accrued above must not carry over.
        let second = controller.new_delay_token(10_000_000);
        assert_eq!(controller.get_delay(&clock, 20_000_000), 2_000_000);
        clock.advance(1_999_900);
        let delay = controller.get_delay(&clock, 1_000);
        assert_eq!(delay, 1_100);

        // Sleeping out exactly the returned delay pays the debt down to a comfortable surplus;
        // a subsequent small request is then satisfied for free.
        clock.advance(delay);
        drop(second);
        assert_eq!(controller.get_delay(&clock, 1_000), 0);

        drop(first);
    }

    #[test]
    fn s6_bucket_neutralized_once_all_delay_tokens_drop() {
        let controller = Controller::new(10_000_000);
        let clock = ManualClock::new(6666);
        let token = controller.new_delay_token(1_000);
        assert_eq!(controller.get_delay(&clock, 30_000_000), bucket::MAX_SLEEP_US);
        drop(token);
        assert_eq!(controller.get_delay(&clock, 30_000_000), 0);
        assert!(!controller.is_stopped());
    }

    #[test]
    fn get_delay_never_reads_clock_when_undelayed() {
        struct PanicClock;
        impl Clock for PanicClock {
            fn now_micros(&self) -> u64 {
                panic!("must not read the clock while undelayed");
            }
        }
        let controller = Controller::new(10_000_000);
        assert_eq!(controller.get_delay(&PanicClock, 1_000_000), 0);
    }

    #[test]
    fn try_new_delay_token_rejects_zero_rate() {
        let controller = Controller::new(10_000_000);
        let err = controller.try_new_delay_token(0).unwrap_err();
        assert_eq!(err, WriteControllerError::NonPositiveRate(0));
    }

    #[test]
    #[should_panic(expected = "new_delay_token")]
    fn new_delay_token_panics_on_zero_rate() {
        let controller = Controller::new(10_000_000);
        let _ = controller.new_delay_token(0);
    }

    #[test]
    fn tokens_outlive_a_dropped_controller_clone() {
        let controller = Controller::new(10_000_000);
        let clone = controller.clone();
        let stop = clone.new_stop_token();
        drop(clone);
        assert!(controller.is_stopped());
        drop(stop);
        assert!(!controller.is_stopped());
    }

    #[test]
    fn metrics_track_vote_counts() {
        let controller = Controller::new(10_000_000);
        let stop = controller.new_stop_token();
        let delay = controller.new_delay_token(5_000_000);
        assert_eq!(controller.metrics().stop_votes.get(), 1);
        assert_eq!(controller.metrics().delay_votes.get(), 1);
        assert_eq!(
            controller.metrics().current_delay_rate_bytes_per_sec.get(),
            5_000_000
        );
        drop(stop);
        drop(delay);
        assert_eq!(controller.metrics().stop_votes.get(), 0);
        assert_eq!(controller.metrics().delay_votes.get(), 0);
        assert_eq!(
            controller.metrics().current_delay_rate_bytes_per_sec.get(),
            0
        );
    }

    #[test]
    fn current_delay_rate_drops_to_zero_with_the_last_token() {
        let controller = Controller::new(1_000);
        let token = controller.new_delay_token(500);
        assert_eq!(controller.current_delay_rate_bytes_per_sec(), 500);
        assert_eq!(
            controller.metrics().current_delay_rate_bytes_per_sec.get(),
            500
        );
        drop(token);
        assert_eq!(controller.current_delay_rate_bytes_per_sec(), 0);
        assert_eq!(
            controller.metrics().current_delay_rate_bytes_per_sec.get(),
            0
        );
    }

    #[test]
    fn gauges_reflect_true_atomic_counts_under_interleaved_votes() {
        // Regression for a race where the gauge was set from a locally-captured `previous`
        // value instead of a fresh load of the atomic: two overlapping mints/drops must still
        // leave the gauge equal to the true live count, not whatever the slower update wrote.
        let controller = Controller::new(10_000_000);
        let a = controller.new_stop_token();
        let b = controller.new_stop_token();
        let c = controller.new_stop_token();
        assert_eq!(controller.metrics().stop_votes.get(), 3);
        drop(b);
        assert_eq!(controller.metrics().stop_votes.get(), 2);
        drop(a);
        drop(c);
        assert_eq!(controller.metrics().stop_votes.get(), 0);
    }
}
